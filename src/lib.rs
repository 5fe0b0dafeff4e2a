//! # popflow
//!
//! `popflow` is a single-instance execution engine for process activities
//! (tasks, events, boundary events, transactions) driven entirely by an
//! in-process message broker.
//!
//! Every activity owns a broker. Its lifecycle phases, its executions and the
//! commands sent to it are messages on that broker, which is what makes a
//! running activity stoppable, serialisable and resumable.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, queues, consumers and shovels with state snapshots.
//! - `activity`: the activity runtime, its command channel and context.
//! - `event_definitions`: error, signal, timer, cancel and compensate events.
//! - `behaviours`: element behaviours, including transactions with compensation.
//! - `config`: layered settings.
//! - `persistence`: a `sled` store for activity snapshots.
//! - `utils`: error types and logging.

pub mod activity;
pub mod behaviours;
pub mod broker;
pub mod config;
pub mod event_definitions;
pub mod persistence;
pub mod utils;
