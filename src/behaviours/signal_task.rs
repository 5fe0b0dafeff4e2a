//! Signal task
//!
//! A task without work of its own. It waits until a command arrives on the
//! command channel of its execution:
//!
//! - `signal` completes with the signal payload as output
//! - `error` fails with an [`ActivityError`] built from the payload
//! - `cancel` and `discard` end the execution accordingly
//! - `stop` only stops listening

use std::rc::Rc;

use serde_json::Value;

use crate::activity::{Activity, Behaviour, Command};
use crate::behaviours::{LoopCharacteristics, LoopExecution};
use crate::broker::{Content, Message, Properties, SubscribeOptions};
use crate::utils::{ActivityError, Result};

pub struct SignalTaskBehaviour {
    looped: Option<Rc<LoopExecution>>,
}

impl SignalTaskBehaviour {
    pub fn new(loop_characteristics: Option<LoopCharacteristics>) -> Rc<Self> {
        Rc::new(Self {
            looped: loop_characteristics.map(LoopExecution::new),
        })
    }

    fn api_tag(execution_id: &str) -> String {
        format!("_api-{execution_id}")
    }

    fn on_api_message(activity: &Activity, content: &Content, message: &Message) -> Result<()> {
        let Some(command) = Command::from_message(message) else {
            return Ok(());
        };
        let broker = activity.broker();
        let tag = Self::api_tag(content.execution_id());

        let (routing_key, terminal) = match command {
            Command::Stop => {
                broker.cancel(&tag);
                return Ok(());
            }
            Command::Signal(payload) => {
                let mut completed = content.clone().with_state("signal");
                completed.output = payload;
                ("execute.completed", completed)
            }
            Command::Error(payload) => {
                let error = ActivityError::from_payload(content, payload);
                let mut failed = content.clone().with_state("error");
                failed.error = Some(error.to_value());
                ("execute.error", failed)
            }
            Command::Cancel(payload) => {
                let mut cancelled = content.clone().with_state("cancel");
                cancelled.output = payload;
                ("execute.cancel", cancelled)
            }
            Command::Discard(_) => ("execute.discard", content.clone().with_state("discard")),
            Command::Throw(_) => return Ok(()),
        };

        broker.cancel(&tag);
        activity.publish_execution(routing_key, terminal, Properties::default())?;
        Ok(())
    }
}

impl Behaviour for SignalTaskBehaviour {
    fn execute(self: Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let content = &message.content;
        if content.is_root_scope {
            if let Some(looped) = &self.looped {
                return looped.execute(activity, message);
            }
        }

        let broker = activity.broker();
        let tag = Self::api_tag(content.execution_id());
        broker.cancel(&tag);

        let weak = activity.downgrade();
        let own = content.clone();
        broker.subscribe_tmp(
            "api",
            &format!("activity.*.{}", content.execution_id()),
            move |_, command, _| match weak.upgrade() {
                Some(activity) => Self::on_api_message(&activity, &own, command),
                None => Ok(()),
            },
            SubscribeOptions::new().consumer_tag(tag).no_ack(),
        )?;

        let mut wait = content.clone().with_state("wait");
        wait.is_recovered = message.fields.redelivered;
        activity.publish_event("wait", wait, Properties::default())?;
        Ok(())
    }

    fn get_state(&self, _activity: &Activity) -> Option<Value> {
        self.looped.as_ref().and_then(|looped| looped.get_state())
    }

    fn recover(&self, _activity: &Activity, state: &Value) -> Result<()> {
        match &self.looped {
            Some(looped) => looped.recover(state),
            None => Ok(()),
        }
    }
}
