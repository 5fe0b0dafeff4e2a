//! Activity runtime
//!
//! Gives every process element the same broker driven lifecycle. Run phases
//! are messages on the `run` exchange consumed one at a time from `run-q`:
//!
//! `run.enter -> run.start -> run.execute -> run.end | run.discard | run.error -> run.leave`
//!
//! `run.execute` stays unacked until the root execution publishes its
//! terminal message, so stopping an activity mid-execution leaves it in the
//! queue and resuming redelivers it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::activity::Behaviour;
use crate::activity::command::ActivityApi;
use crate::activity::context::Context;
use crate::activity::definition::ActivityDefinition;
use crate::activity::execution::ActivityExecution;
use crate::broker::{Broker, BrokerState, Content, ExchangeType, Message, Properties, QueueOptions, Routed, SubscribeOptions};
use crate::utils::{EngineError, Result};

pub const RUN_QUEUE: &str = "run-q";
pub const EXECUTION_QUEUE: &str = "execution-q";
const RUN_CONSUMER: &str = "_activity-run";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    #[default]
    Idle,
    Entered,
    Started,
    Executing,
    Executed,
    Discarded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub taken: u32,
    pub discarded: u32,
}

/// Serialisable snapshot of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ActivityStatus,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub content: Content,
    pub broker: BrokerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviour: Option<Value>,
}

#[derive(Default)]
struct RunState {
    status: ActivityStatus,
    execution_id: Option<String>,
    content: Content,
    counters: Counters,
    stopped: bool,
    execute_message: Option<Message>,
    execution: Option<Rc<ActivityExecution>>,
}

struct ActivityInner {
    definition: ActivityDefinition,
    context: Context,
    broker: Broker,
    attached_to: Option<Activity>,
    behaviour: Rc<dyn Behaviour>,
    run: RefCell<RunState>,
}

#[derive(Clone)]
pub struct Activity {
    inner: Rc<ActivityInner>,
}

/// Handle that does not keep the activity alive; captured by handlers the
/// activity's own broker stores.
#[derive(Clone)]
pub struct WeakActivity {
    inner: Weak<ActivityInner>,
}

impl WeakActivity {
    /// `None` once the activity has been dropped.
    pub fn upgrade(&self) -> Option<Activity> {
        self.inner.upgrade().map(|inner| Activity { inner })
    }
}

impl Activity {
    /// Build an activity with its own broker. Exchanges and durable queues are
    /// declared here, together with whatever its event definitions need
    /// before a run.
    pub fn new(definition: ActivityDefinition, context: &Context, behaviour: Rc<dyn Behaviour>) -> Result<Self> {
        Self::build(definition, context, None, behaviour)
    }

    /// Activity bound to the lifecycle of `host`, e.g. a boundary event.
    pub fn new_attached(
        definition: ActivityDefinition,
        context: &Context,
        host: &Activity,
        behaviour: Rc<dyn Behaviour>,
    ) -> Result<Self> {
        let mut definition = definition;
        definition.attached_to = Some(host.id().to_string());
        Self::build(definition, context, Some(host.clone()), behaviour)
    }

    fn build(
        definition: ActivityDefinition,
        context: &Context,
        attached_to: Option<Activity>,
        behaviour: Rc<dyn Behaviour>,
    ) -> Result<Self> {
        let broker = Broker::new(&definition.id);
        for exchange in ["run", "execution", "event", "api"] {
            broker.assert_exchange(exchange, ExchangeType::Topic)?;
        }
        broker.assert_queue(RUN_QUEUE, QueueOptions::default());
        broker.bind_queue(RUN_QUEUE, "run", "run.#", 0)?;
        broker.assert_queue(EXECUTION_QUEUE, QueueOptions::default());
        broker.bind_queue(EXECUTION_QUEUE, "execution", "execute.#", 0)?;
        for (index, event_definition) in definition.event_definitions.iter().enumerate() {
            event_definition.setup(&broker, index, definition.is_throwing)?;
        }

        Ok(Self {
            inner: Rc::new(ActivityInner {
                definition,
                context: context.clone(),
                broker,
                attached_to,
                behaviour,
                run: RefCell::new(RunState::default()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.definition.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.definition.name.as_deref()
    }

    pub fn definition(&self) -> &ActivityDefinition {
        &self.inner.definition
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Broker carrying the activity's run, execution, event and api
    /// messages.
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Host of a boundary event.
    pub fn attached_to(&self) -> Option<&Activity> {
        self.inner.attached_to.as_ref()
    }

    pub fn behaviour(&self) -> Rc<dyn Behaviour> {
        self.inner.behaviour.clone()
    }

    /// Handle for handlers stored on the activity's own broker.
    pub fn downgrade(&self) -> WeakActivity {
        WeakActivity {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Activity) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> ActivityStatus {
        self.inner.run.borrow().status
    }

    /// Whether a run has entered and not yet left, stopped runs included.
    pub fn is_running(&self) -> bool {
        self.status() != ActivityStatus::Idle
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.run.borrow().stopped
    }

    /// Execution id of the current or last run.
    pub fn execution_id(&self) -> Option<String> {
        self.inner.run.borrow().execution_id.clone()
    }

    /// Taken and discarded runs so far.
    pub fn counters(&self) -> Counters {
        self.inner.run.borrow().counters
    }

    /// Content of the current run.
    pub fn content(&self) -> Content {
        self.inner.run.borrow().content.clone()
    }

    /// Command channel of an execution; the current run when `content` is
    /// `None`.
    pub fn get_api(&self, content: Option<Content>) -> ActivityApi {
        ActivityApi::new(self.broker(), content.unwrap_or_else(|| self.content()))
    }

    /// Publish `activity.<phase>` on the `event` exchange.
    pub fn publish_event(&self, phase: &str, content: Content, properties: Properties) -> Result<Routed> {
        self.broker()
            .publish("event", &format!("activity.{phase}"), content, properties)
    }

    /// Publish on the `execution` exchange, where `execution-q` picks it up.
    pub fn publish_execution(&self, routing_key: &str, content: Content, properties: Properties) -> Result<Routed> {
        self.broker()
            .publish("execution", routing_key, content, properties)
    }

    /// Start a new run. `content` may carry `parent` and `inbound`.
    pub fn run(&self, content: Option<Content>) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning(self.id().to_string()));
        }

        let execution_id = format!("{}_{}", self.id(), short_id());
        let definition = &self.inner.definition;
        let mut content = content.unwrap_or_default();
        content.id = Some(definition.id.clone());
        content.kind = Some(definition.kind.clone());
        content.execution_id = Some(execution_id.clone());
        if definition.attached_to.is_some() {
            content.attached_to = definition.attached_to.clone();
            content.cancel_activity = Some(definition.cancel_activity);
        }

        {
            let mut run = self.inner.run.borrow_mut();
            run.execution_id = Some(execution_id.clone());
            run.content = content.clone();
            run.stopped = false;
        }

        debug!(activity = self.id(), execution_id, "run");
        self.consume_run()?;
        self.broker().publish("run", "run.enter", content, Properties::default())?;
        Ok(())
    }

    /// Stop the current run, keeping it resumable.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() || self.is_stopped() {
            return Ok(());
        }
        self.get_api(None).stop()?;
        if !self.is_stopped() {
            self.stop_run()?;
        }
        Ok(())
    }

    /// Continue a stopped run; the held `run.execute` is redelivered.
    pub fn resume(&self) -> Result<()> {
        {
            let mut run = self.inner.run.borrow_mut();
            if !run.stopped {
                return Ok(());
            }
            run.stopped = false;
            if run.status == ActivityStatus::Idle {
                return Ok(());
            }
        }
        debug!(activity = self.id(), "resume");
        self.consume_run()
    }

    /// Serialisable snapshot of the activity: status, counters, broker
    /// state and behaviour state. Take it from a stopped or idle activity.
    pub fn get_state(&self) -> ActivityState {
        let (status, stopped, execution_id, counters, content) = {
            let run = self.inner.run.borrow();
            (
                run.status,
                run.stopped,
                run.execution_id.clone(),
                run.counters,
                run.content.clone(),
            )
        };

        ActivityState {
            id: self.id().to_string(),
            kind: self.kind().to_string(),
            status,
            stopped,
            execution_id,
            counters,
            content,
            broker: self.broker().get_state(),
            behaviour: self.inner.behaviour.get_state(self),
        }
    }

    /// Restore a snapshot. The activity is left stopped; call `resume` to
    /// continue.
    pub fn recover(&self, state: &ActivityState) -> Result<()> {
        if state.id != self.id() {
            return Err(EngineError::StateMismatch {
                expected: self.id().to_string(),
                found: state.id.clone(),
            });
        }
        if self.is_running() && !self.is_stopped() {
            return Err(EngineError::AlreadyRunning(self.id().to_string()));
        }

        {
            let mut run = self.inner.run.borrow_mut();
            run.status = state.status;
            run.execution_id = state.execution_id.clone();
            run.counters = state.counters;
            run.content = state.content.clone();
            run.stopped = state.status != ActivityStatus::Idle;
            run.execute_message = None;
            run.execution = None;
        }

        self.broker().recover(&state.broker)?;
        if let Some(behaviour) = &state.behaviour {
            self.inner.behaviour.recover(self, behaviour)?;
        }
        debug!(activity = self.id(), status = ?state.status, "recovered");
        Ok(())
    }

    fn consume_run(&self) -> Result<()> {
        if self.broker().get_consumer(RUN_CONSUMER).is_some() {
            return Ok(());
        }
        let activity = self.downgrade();
        self.broker().consume(
            RUN_QUEUE,
            move |routing_key, message, _| match activity.upgrade() {
                Some(activity) => activity.on_run_message(routing_key, message),
                None => Ok(()),
            },
            SubscribeOptions::new().consumer_tag(RUN_CONSUMER),
        )?;
        Ok(())
    }

    fn set_status(&self, status: ActivityStatus) {
        self.inner.run.borrow_mut().status = status;
    }

    fn on_run_message(&self, routing_key: &str, message: &Message) -> Result<()> {
        let broker = self.broker();
        let content = message.content.clone();
        debug!(activity = self.id(), routing_key, redelivered = message.fields.redelivered, "run message");

        match routing_key {
            "run.enter" => {
                self.set_status(ActivityStatus::Entered);
                self.publish_event("enter", content.clone(), Properties::default())?;
                broker.publish("run", "run.start", content, Properties::default())?;
            }
            "run.start" => {
                self.set_status(ActivityStatus::Started);
                self.publish_event("start", content.clone(), Properties::default())?;
                broker.publish("run", "run.execute", content, Properties::default())?;
            }
            "run.execute" => {
                let execution_id = content.execution_id().to_string();
                let execution = Rc::new(ActivityExecution::new(self, &execution_id));
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = ActivityStatus::Executing;
                    run.execute_message = Some(message.clone());
                    run.execution = Some(execution.clone());
                }
                // acked once the root execution terminates
                return execution.execute(self, message);
            }
            "run.end" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = ActivityStatus::Executed;
                    run.counters.taken += 1;
                }
                self.publish_event("end", content.clone(), Properties::default())?;
                broker.publish("run", "run.leave", content, Properties::default())?;
            }
            "run.discard" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = ActivityStatus::Discarded;
                    run.counters.discarded += 1;
                }
                self.publish_event("discard", content.clone(), Properties::default())?;
                broker.publish("run", "run.leave", content, Properties::default())?;
            }
            "run.error" => {
                self.set_status(ActivityStatus::Failed);
                let routed = self.publish_event("error", content.clone(), Properties::mandatory())?;
                if routed == Routed::Unroutable && self.context().settings.strict_errors {
                    error!(activity = self.id(), error = ?content.error, "unhandled activity error");
                }
                broker.publish("run", "run.leave", content, Properties::default())?;
            }
            "run.leave" => {
                broker.ack(message)?;
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = ActivityStatus::Idle;
                    run.execute_message = None;
                    run.execution = None;
                }
                self.publish_event("leave", content, Properties::default())?;
                return Ok(());
            }
            _ => {}
        }
        broker.ack(message)
    }

    /// Called by the execution once the root execution published its terminal
    /// message. Translates it into the matching run phase and releases the
    /// held `run.execute`.
    pub(crate) fn complete_execution(&self, routing_key: &str, message: &Message) -> Result<()> {
        let (run_content, execute_message) = {
            let mut run = self.inner.run.borrow_mut();
            (run.content.clone(), run.execute_message.take())
        };

        let mut content = message.content.clone();
        content.execution_id = run_content.execution_id.clone();
        content.parent = run_content.parent.clone();
        content.is_root_scope = false;

        let broker = self.broker();
        match routing_key {
            "execute.completed" => {
                broker.publish("run", "run.end", content, Properties::default())?;
            }
            "execute.cancel" => {
                self.publish_event("cancel", content.clone(), Properties::default())?;
                broker.publish("run", "run.end", content, Properties::default())?;
            }
            "execute.discard" => {
                broker.publish("run", "run.discard", content, Properties::default())?;
            }
            "execute.error" => {
                broker.publish("run", "run.error", content, Properties::default())?;
            }
            _ => return Ok(()),
        }

        if let Some(execute_message) = execute_message {
            broker.ack(&execute_message)?;
        }
        Ok(())
    }

    /// Cancel run and execution consumers; held messages go back to their
    /// queues as redelivered.
    pub(crate) fn stop_run(&self) -> Result<()> {
        let (execution, content) = {
            let mut run = self.inner.run.borrow_mut();
            if run.stopped {
                return Ok(());
            }
            run.stopped = true;
            run.execute_message = None;
            (run.execution.take(), run.content.clone())
        };

        self.broker().cancel(RUN_CONSUMER);
        if let Some(execution) = execution {
            execution.stop(self);
        }
        debug!(activity = self.id(), "stopped");
        self.publish_event("stop", content, Properties::default())?;
        Ok(())
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id())
            .field("type", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..7].to_string()
}
