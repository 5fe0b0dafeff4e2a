//! The `activity` module wraps process elements in a uniform, broker driven
//! lifecycle.
//!
//! - `runtime`: [`Activity`], run phases, stop/resume, state snapshots.
//! - `execution`: execution queue handling for one run.
//! - `command`: the `api` command channel.
//! - `context`: environment, element lookup and engine settings.
//! - `definition`: static element description.

pub mod command;
pub mod context;
pub mod definition;
pub(crate) mod execution;
pub mod runtime;

use std::rc::Rc;

use serde_json::Value;

use crate::broker::Message;
use crate::utils::Result;

pub use command::{ActivityApi, Command};
pub use context::{Context, ElementRef, Environment};
pub use definition::ActivityDefinition;
pub use runtime::{Activity, ActivityState, ActivityStatus, Counters, WeakActivity};

/// Element specific behaviour run by the activity runtime.
///
/// `execute` is called with every `execute.start` message of the activity,
/// the root execution as well as sub-executions (event definitions, loop
/// iterations). The behaviour must eventually publish exactly one terminal
/// message (`execute.completed`, `execute.discard`, `execute.error` or
/// `execute.cancel`) per execution id on the `execution` exchange.
pub trait Behaviour {
    fn execute(self: Rc<Self>, activity: &Activity, message: &Message) -> Result<()>;

    /// Serialisable behaviour state, captured with the activity state.
    fn get_state(&self, _activity: &Activity) -> Option<Value> {
        None
    }

    fn recover(&self, _activity: &Activity, _state: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests;
