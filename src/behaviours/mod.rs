//! Element behaviours run by the activity runtime.
//!
//! - `event`: start, intermediate and end events, catching or throwing.
//! - `boundary_event`: events attached to a host activity.
//! - `signal_task`: a wait state released by commands, optionally looped.
//! - `loop_characteristics`: iteration controller for looped tasks.
//! - `transaction`: sub-process with compensation on abort.

pub mod boundary_event;
pub mod event;
pub mod loop_characteristics;
pub mod signal_task;
pub mod transaction;

pub use boundary_event::BoundaryEventBehaviour;
pub use event::EventBehaviour;
pub use loop_characteristics::{LoopCharacteristics, LoopExecution};
pub use signal_task::SignalTaskBehaviour;
pub use transaction::{Transaction, TransactionBehaviour};
