//! Execution of one run.
//!
//! Consumes `execution-q` (`execute.#`). Every `execute.start` is held unacked
//! while its execution is pending and handed to the behaviour; terminal
//! messages release it. The root terminal completes the run.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::activity::command::Command;
use crate::activity::runtime::{Activity, EXECUTION_QUEUE, WeakActivity};
use crate::broker::{Content, Message, Properties, SubscribeOptions};
use crate::utils::Result;

pub(crate) const EXECUTION_CONSUMER: &str = "_activity-execution";

pub(crate) fn is_terminal(routing_key: &str) -> bool {
    matches!(
        routing_key,
        "execute.completed" | "execute.cancel" | "execute.discard" | "execute.error"
    )
}

pub(crate) struct ActivityExecution {
    activity: WeakActivity,
    execution_id: String,
    postponed: RefCell<Vec<Message>>,
    completed: Cell<bool>,
}

impl ActivityExecution {
    pub(crate) fn new(activity: &Activity, execution_id: &str) -> Self {
        Self {
            activity: activity.downgrade(),
            execution_id: execution_id.to_string(),
            postponed: RefCell::new(Vec::new()),
            completed: Cell::new(false),
        }
    }

    fn api_tag(&self) -> String {
        format!("_activity-api-{}", self.execution_id)
    }

    /// Attach to the execution queue. A redelivered `run.execute` means the
    /// pending executions are already queued and only need re-consuming.
    pub(crate) fn execute(self: &Rc<Self>, activity: &Activity, run_message: &Message) -> Result<()> {
        let broker = activity.broker();
        let redelivered = run_message.fields.redelivered;
        if !redelivered {
            let purged = broker.purge_queue(EXECUTION_QUEUE);
            if purged > 0 {
                debug!(activity = activity.id(), purged, "dropped stale execution messages");
            }
        }

        let execution = Rc::clone(self);
        broker.subscribe_tmp(
            "api",
            &format!("activity.*.{}", self.execution_id),
            move |_, message, _| execution.on_api_message(message),
            SubscribeOptions::new()
                .consumer_tag(self.api_tag())
                .no_ack()
                .priority(-100),
        )?;

        let execution = Rc::clone(self);
        broker.consume(
            EXECUTION_QUEUE,
            move |routing_key, message, _| execution.on_execute_message(routing_key, message),
            SubscribeOptions::new()
                .consumer_tag(EXECUTION_CONSUMER)
                .prefetch(usize::MAX),
        )?;

        if !redelivered {
            let mut content = run_message.content.clone();
            content.is_root_scope = true;
            content.execution_id = Some(self.execution_id.clone());
            activity.publish_execution("execute.start", content, Properties::default())?;
        }
        Ok(())
    }

    pub(crate) fn stop(&self, activity: &Activity) {
        let broker = activity.broker();
        broker.cancel(&self.api_tag());
        broker.cancel(EXECUTION_CONSUMER);
        self.postponed.borrow_mut().clear();
    }

    fn root_content(&self, activity: &Activity) -> Content {
        let postponed = self.postponed.borrow();
        match postponed
            .iter()
            .find(|m| m.content.execution_id() == self.execution_id)
        {
            Some(start) => start.content.clone(),
            None => {
                let mut content = activity.content();
                content.is_root_scope = true;
                content
            }
        }
    }

    fn on_api_message(&self, message: &Message) -> Result<()> {
        let Some(activity) = self.activity.upgrade() else {
            return Ok(());
        };
        match Command::from_message(message) {
            Some(Command::Stop) => activity.stop_run(),
            Some(Command::Discard(_)) if !self.completed.get() => {
                let content = self.root_content(&activity);
                activity.publish_execution("execute.discard", content, Properties::default())?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_execute_message(&self, routing_key: &str, message: &Message) -> Result<()> {
        let Some(activity) = self.activity.upgrade() else {
            return Ok(());
        };
        let broker = activity.broker();

        if is_terminal(routing_key) {
            return self.on_terminal(&activity, routing_key, message);
        }
        if routing_key != "execute.start" || self.completed.get() {
            return broker.ack(message);
        }

        let previous = {
            let mut postponed = self.postponed.borrow_mut();
            let previous = postponed
                .iter()
                .position(|m| m.content.execution_id == message.content.execution_id)
                .map(|index| postponed.remove(index));
            postponed.push(message.clone());
            previous
        };
        if let Some(previous) = previous {
            broker.ack(&previous)?;
        }

        activity.behaviour().execute(&activity, message)
    }

    fn on_terminal(&self, activity: &Activity, routing_key: &str, message: &Message) -> Result<()> {
        let broker = activity.broker();
        broker.ack(message)?;
        if self.completed.get() {
            return Ok(());
        }

        let execution_id = message.content.execution_id();
        let start = {
            let mut postponed = self.postponed.borrow_mut();
            postponed
                .iter()
                .position(|m| m.content.execution_id() == execution_id)
                .map(|index| postponed.remove(index))
        };
        if let Some(start) = &start {
            broker.ack(start)?;
        }
        if execution_id != self.execution_id {
            return Ok(());
        }

        self.completed.set(true);
        let held: Vec<Message> = self.postponed.borrow_mut().drain(..).collect();
        for pending in &held {
            broker.ack(pending)?;
        }
        broker.cancel(&self.api_tag());
        broker.cancel(EXECUTION_CONSUMER);

        debug!(activity = activity.id(), execution_id, routing_key, "execution completed");
        activity.complete_execution(routing_key, message)
    }
}
