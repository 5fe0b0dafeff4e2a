//! Event definitions
//!
//! Each definition of an event runs as its own sub-execution
//! (`<rootExecutionId>_<index>`) started by [`EventDefinitionExecution`].
//! Definitions keep no state of their own: everything they wait for is a
//! broker subscription tagged with their execution id, so a redelivered
//! `execute.start` simply subscribes again.
//!
//! Listener tags per execution id:
//!
//! | tag | listens to |
//! |---|---|
//! | `_api-<id>` | commands addressed to the definition execution |
//! | `_onthrow-<id>` | delegated `activity.throw.#` |
//! | `_onerror-<id>` | forwarded host error (`execute.throw.<id>`) |
//! | `_onsignal-<id>` | `activity.signal.#` |
//! | `_oncancel-<id>` | host `activity.cancel` forwarded to `attached-event` |

pub mod cancel;
pub mod compensate;
pub mod error;
pub mod execution;
pub mod signal;
pub mod timer;

use serde_json::{Map, Value, json};

use crate::activity::{Activity, Command};
use crate::broker::{Broker, Content, Message, Properties, SubscribeOptions};
use crate::utils::Result;

pub use execution::EventDefinitionExecution;
pub use timer::parse_duration;

#[derive(Debug, Clone, PartialEq)]
pub enum EventDefinition {
    Error { error_ref: Option<String> },
    Signal { signal_ref: Option<String> },
    Timer { time_duration: Option<String> },
    Cancel,
    Compensate,
}

impl EventDefinition {
    pub fn error(error_ref: Option<&str>) -> Self {
        Self::Error {
            error_ref: error_ref.map(str::to_string),
        }
    }

    pub fn signal(signal_ref: Option<&str>) -> Self {
        Self::Signal {
            signal_ref: signal_ref.map(str::to_string),
        }
    }

    pub fn timer(time_duration: &str) -> Self {
        Self::Timer {
            time_duration: Some(time_duration.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "bpmn:ErrorEventDefinition",
            Self::Signal { .. } => "bpmn:SignalEventDefinition",
            Self::Timer { .. } => "bpmn:TimerEventDefinition",
            Self::Cancel => "bpmn:CancelEventDefinition",
            Self::Compensate => "bpmn:CompensateEventDefinition",
        }
    }

    /// Declare what the definition at `index` needs on the event broker
    /// before any run.
    pub(crate) fn setup(&self, broker: &Broker, index: usize, throwing: bool) -> Result<()> {
        match (self, throwing) {
            (Self::Error { .. }, false) => error::setup_catch(broker, index),
            _ => Ok(()),
        }
    }

    /// Run the definition for a sub-execution `execute.start` message.
    pub(crate) fn execute(&self, activity: &Activity, message: &Message) -> Result<()> {
        let throwing = activity.definition().is_throwing;
        match (self, throwing) {
            (Self::Error { error_ref }, false) => error::execute_catch(activity, error_ref.as_deref(), message),
            (Self::Error { error_ref }, true) => error::execute_throw(activity, error_ref.as_deref(), message),
            (Self::Signal { signal_ref }, false) => signal::execute_catch(activity, signal_ref.as_deref(), message),
            (Self::Signal { signal_ref }, true) => signal::execute_throw(activity, signal_ref.as_deref(), message),
            (Self::Timer { time_duration }, _) => timer::execute(activity, time_duration.as_deref(), message),
            (Self::Cancel, false) => cancel::execute_catch(activity, message),
            (Self::Cancel, true) => cancel::execute_throw(activity, message),
            (Self::Compensate, false) => compensate::execute_catch(activity, message),
            (Self::Compensate, true) => compensate::execute_throw(activity, message),
        }
    }
}

const LISTENER_PREFIXES: [&str; 5] = ["_api-", "_onthrow-", "_onerror-", "_onsignal-", "_oncancel-"];

/// Cancel every listener of a definition execution. Safe to repeat.
pub(crate) fn stop_listeners(broker: &Broker, execution_id: &str) {
    for prefix in LISTENER_PREFIXES {
        broker.cancel(&format!("{prefix}{execution_id}"));
    }
}

/// Content published on the `event` exchange, as seen by the owning event.
pub(crate) fn event_content(content: &Content, state: &str) -> Content {
    content.shift_parent().with_state(state)
}

/// Whether a command routing key addresses this definition execution or the
/// event execution owning it.
pub(crate) fn targets_execution(routing_key: &str, content: &Content) -> bool {
    let Some(target) = routing_key.rsplit('.').next() else {
        return false;
    };
    target == content.execution_id() || Some(target) == content.parent_execution_id()
}

/// Handle `stop` and `discard` addressed to the definition execution.
/// Returns `true` when the command was consumed.
pub(crate) fn on_lifecycle_command(activity: &Activity, content: &Content, command: &Message) -> Result<bool> {
    match Command::from_message(command) {
        Some(Command::Stop) => {
            stop_listeners(activity.broker(), content.execution_id());
            Ok(true)
        }
        Some(Command::Discard(_)) => {
            stop_listeners(activity.broker(), content.execution_id());
            activity.publish_execution("execute.discard", content.clone(), Properties::default())?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Listen for `stop` and `discard` addressed to the definition execution.
pub(crate) fn listen_for_commands(activity: &Activity, content: &Content) -> Result<()> {
    let weak = activity.downgrade();
    let own = content.clone();
    activity.broker().subscribe_tmp(
        "api",
        &format!("activity.*.{}", content.execution_id()),
        move |_, command, _| match weak.upgrade() {
            Some(activity) => on_lifecycle_command(&activity, &own, command).map(|_| ()),
            None => Ok(()),
        },
        SubscribeOptions::new()
            .consumer_tag(format!("_api-{}", content.execution_id()))
            .no_ack(),
    )?;
    Ok(())
}

/// Listen on `activity.signal.#`; `on_signal` runs with the signal payload for
/// every message `accept` lets through.
pub(crate) fn listen_for_signal(
    activity: &Activity,
    content: &Content,
    accept: impl Fn(&Message, &Content) -> bool + 'static,
    on_signal: fn(&Activity, &Content, Option<Value>) -> Result<()>,
) -> Result<()> {
    let weak = activity.downgrade();
    let own = content.clone();
    activity.broker().subscribe_tmp(
        "api",
        "activity.signal.#",
        move |_, signal, _| {
            let Some(activity) = weak.upgrade() else {
                return Ok(());
            };
            if !accept(signal, &own) {
                return Ok(());
            }
            on_signal(&activity, &own, signal.content.message.clone())
        },
        SubscribeOptions::new()
            .consumer_tag(format!("_onsignal-{}", content.execution_id()))
            .no_ack()
            .priority(300),
    )?;
    Ok(())
}

/// Describe a referenced element as `{id, name, code}`; `{name: "anonymous"}`
/// without reference and `{id}` when the reference does not resolve.
pub(crate) fn describe_reference(activity: &Activity, reference: Option<&str>) -> Value {
    let Some(id) = reference else {
        return json!({ "name": "anonymous" });
    };
    let Some(element) = activity.context().get_activity_by_id(id) else {
        return json!({ "id": id });
    };

    let mut described = Map::new();
    described.insert("id".into(), Value::String(element.id.clone()));
    if let Some(name) = &element.name {
        described.insert("name".into(), Value::String(name.clone()));
    }
    if let Some(code) = &element.code {
        let code = activity.context().environment.resolve_expression(code);
        described.insert("code".into(), Value::String(code));
    }
    Value::Object(described)
}

/// Publish the delegated throw of a throwing definition and complete it.
pub(crate) fn throw(activity: &Activity, content: &Content, phase: &str, kind: &str, thrown: Value) -> Result<()> {
    let mut event = event_content(content, "throw");
    event.message = Some(thrown.clone());
    activity.publish_event(phase, event, Properties::delegated(kind))?;

    let mut completed = content.clone();
    completed.message = Some(thrown);
    complete(activity, completed, "throw")
}

/// Publish `execute.completed` for a definition execution.
pub(crate) fn complete(activity: &Activity, mut content: Content, state: &str) -> Result<()> {
    stop_listeners(activity.broker(), content.execution_id());
    content.state = Some(state.to_string());
    activity.publish_execution("execute.completed", content, Properties::default())?;
    Ok(())
}

#[cfg(test)]
mod tests;
