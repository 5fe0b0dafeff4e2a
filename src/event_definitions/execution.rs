//! Runs the event definitions of one event and folds their outcomes into a
//! single root terminal.
//!
//! The first definition to complete wins: its siblings are discarded and the
//! root completion is published on the configured routing key. The root is
//! discarded only once every definition was discarded.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::{Activity, Command};
use crate::broker::{Broker, Content, Message, Properties, SubscribeOptions};
use crate::event_definitions::EventDefinition;
use crate::utils::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingExecution {
    root: Content,
    #[serde(default)]
    discarded: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct EventDefinitionExecution {
    definitions: Vec<EventDefinition>,
    completed_routing_key: String,
    pending: RefCell<BTreeMap<String, PendingExecution>>,
}

impl EventDefinitionExecution {
    pub fn new(definitions: Vec<EventDefinition>, completed_routing_key: &str) -> Rc<Self> {
        Rc::new(Self {
            definitions,
            completed_routing_key: completed_routing_key.to_string(),
            pending: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn definitions(&self) -> &[EventDefinition] {
        &self.definitions
    }

    pub fn completed_routing_key(&self) -> &str {
        &self.completed_routing_key
    }

    /// Whether the root execution still waits for a definition.
    pub fn is_pending(&self, execution_id: &str) -> bool {
        self.pending.borrow().contains_key(execution_id)
    }

    fn execute_tag(execution_id: &str) -> String {
        format!("_eventdefinition-execute-{execution_id}")
    }

    fn api_tag(execution_id: &str) -> String {
        format!("_eventdefinition-api-{execution_id}")
    }

    fn definition_execution_id(execution_id: &str, index: usize) -> String {
        format!("{execution_id}_{index}")
    }

    /// Handle an `execute.start`: the root starts every definition, a
    /// definition scoped message runs its definition.
    pub fn execute(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let content = &message.content;
        if content.is_definition_scope {
            return self.execute_definition(activity, message);
        }

        let execution_id = content.execution_id().to_string();
        self.pending
            .borrow_mut()
            .entry(execution_id.clone())
            .or_default()
            .root = content.clone();
        self.listen(activity, &execution_id)?;

        if message.fields.redelivered {
            debug!(activity = activity.id(), execution_id, "event definitions resumed");
            return Ok(());
        }

        for (index, definition) in self.definitions.iter().enumerate() {
            if !self.is_pending(&execution_id) {
                break;
            }
            let mut start = content.clone();
            start.is_root_scope = false;
            start.is_definition_scope = true;
            start.index = Some(index);
            start.execution_id = Some(Self::definition_execution_id(&execution_id, index));
            start.parent = Some(content.unshift_parent());
            start
                .extra
                .insert("definitionType".into(), Value::String(definition.kind().to_string()));
            activity.publish_execution("execute.start", start, Properties::default())?;
        }
        Ok(())
    }

    fn execute_definition(&self, activity: &Activity, message: &Message) -> Result<()> {
        let Some(definition) = message.content.index.and_then(|index| self.definitions.get(index)) else {
            warn!(
                activity = activity.id(),
                index = ?message.content.index,
                "no event definition at index"
            );
            return Ok(());
        };
        definition.execute(activity, message)
    }

    fn listen(self: &Rc<Self>, activity: &Activity, execution_id: &str) -> Result<()> {
        let broker = activity.broker();
        if broker.get_consumer(&Self::execute_tag(execution_id)).is_some() {
            return Ok(());
        }

        let (execution, weak, root) = (Rc::clone(self), activity.downgrade(), execution_id.to_string());
        broker.subscribe_tmp(
            "execution",
            "execute.#",
            move |routing_key, message, _| match weak.upgrade() {
                Some(activity) => execution.on_execute_message(&activity, &root, routing_key, message),
                None => Ok(()),
            },
            SubscribeOptions::new()
                .consumer_tag(Self::execute_tag(execution_id))
                .no_ack()
                .priority(300),
        )?;

        let (execution, weak, root) = (Rc::clone(self), activity.downgrade(), execution_id.to_string());
        broker.subscribe_tmp(
            "api",
            &format!("activity.*.{execution_id}"),
            move |_, message, _| match weak.upgrade() {
                Some(activity) => execution.on_api_message(&activity, &root, message),
                None => Ok(()),
            },
            SubscribeOptions::new()
                .consumer_tag(Self::api_tag(execution_id))
                .no_ack()
                .priority(300),
        )?;
        Ok(())
    }

    fn stop_listening(broker: &Broker, execution_id: &str) {
        broker.cancel(&Self::execute_tag(execution_id));
        broker.cancel(&Self::api_tag(execution_id));
    }

    fn send_to_definitions(&self, broker: &Broker, execution_id: &str, command: &str) -> Result<()> {
        for index in 0..self.definitions.len() {
            let definition_execution_id = Self::definition_execution_id(execution_id, index);
            let content = Content {
                execution_id: Some(definition_execution_id.clone()),
                ..Content::default()
            };
            broker.publish(
                "api",
                &format!("activity.{command}.{definition_execution_id}"),
                content,
                Properties::typed(command),
            )?;
        }
        Ok(())
    }

    fn on_execute_message(&self, activity: &Activity, execution_id: &str, routing_key: &str, message: &Message) -> Result<()> {
        let content = &message.content;
        if !content.is_definition_scope || content.parent_execution_id() != Some(execution_id) {
            return Ok(());
        }
        match routing_key {
            "execute.completed" => self.on_completed(activity, execution_id, content),
            "execute.discard" => self.on_discarded(activity, execution_id, content),
            "execute.error" => self.on_error(activity, execution_id, content),
            _ => Ok(()),
        }
    }

    fn take_pending(&self, execution_id: &str) -> Option<PendingExecution> {
        self.pending.borrow_mut().remove(execution_id)
    }

    fn on_completed(&self, activity: &Activity, execution_id: &str, content: &Content) -> Result<()> {
        let Some(pending) = self.take_pending(execution_id) else {
            return Ok(());
        };
        let broker = activity.broker();
        Self::stop_listening(broker, execution_id);

        for index in (0..self.definitions.len()).filter(|index| Some(*index) != content.index) {
            let sibling = Self::definition_execution_id(execution_id, index);
            broker.publish(
                "api",
                &format!("activity.discard.{sibling}"),
                Content {
                    execution_id: Some(sibling.clone()),
                    ..Content::default()
                },
                Properties::typed("discard"),
            )?;
        }

        let mut completed = pending.root;
        completed.output = content.output.clone();
        completed.state = content.state.clone();
        completed.cancel_activity = content.cancel_activity.or(completed.cancel_activity);
        completed.error = content.error.clone();
        completed.source = content.source.clone();
        completed.message = content.message.clone();
        completed.is_transaction = content.is_transaction;
        debug!(
            activity = activity.id(),
            execution_id,
            index = ?content.index,
            routing_key = %self.completed_routing_key,
            "event definition completed"
        );
        activity.publish_execution(&self.completed_routing_key, completed, Properties::default())?;
        Ok(())
    }

    fn on_discarded(&self, activity: &Activity, execution_id: &str, content: &Content) -> Result<()> {
        let root = {
            let mut pending = self.pending.borrow_mut();
            let Some(execution) = pending.get_mut(execution_id) else {
                return Ok(());
            };
            if let Some(index) = content.index {
                execution.discarded.insert(index);
            }
            if execution.discarded.len() < self.definitions.len() {
                return Ok(());
            }
            pending.remove(execution_id).map(|execution| execution.root)
        };
        let Some(root) = root else {
            return Ok(());
        };

        Self::stop_listening(activity.broker(), execution_id);
        activity.publish_execution("execute.discard", root, Properties::default())?;
        Ok(())
    }

    fn on_error(&self, activity: &Activity, execution_id: &str, content: &Content) -> Result<()> {
        let Some(pending) = self.take_pending(execution_id) else {
            return Ok(());
        };
        Self::stop_listening(activity.broker(), execution_id);

        let mut failed = pending.root;
        failed.error = content.error.clone();
        activity.publish_execution("execute.error", failed, Properties::default())?;
        Ok(())
    }

    fn on_api_message(&self, activity: &Activity, execution_id: &str, message: &Message) -> Result<()> {
        let broker = activity.broker();
        match Command::from_message(message) {
            Some(Command::Discard(_)) if self.is_pending(execution_id) => {
                self.send_to_definitions(broker, execution_id, "discard")?;
                // definitions that never started leave the root pending
                if self.take_pending(execution_id).is_some() {
                    Self::stop_listening(broker, execution_id);
                }
                Ok(())
            }
            Some(Command::Stop) => {
                Self::stop_listening(broker, execution_id);
                self.send_to_definitions(broker, execution_id, "stop")
            }
            _ => Ok(()),
        }
    }

    /// Give up waiting: discard every definition without publishing a root
    /// terminal. The caller publishes its own.
    pub fn discard_definitions(&self, activity: &Activity, execution_id: &str) -> Result<()> {
        if self.take_pending(execution_id).is_none() {
            return Ok(());
        }
        let broker = activity.broker();
        Self::stop_listening(broker, execution_id);
        self.send_to_definitions(broker, execution_id, "discard")
    }

    pub fn get_state(&self) -> Option<Value> {
        let pending = self.pending.borrow();
        if pending.is_empty() {
            return None;
        }
        serde_json::to_value(&*pending).ok()
    }

    pub fn recover(&self, state: &Value) -> Result<()> {
        let recovered: BTreeMap<String, PendingExecution> = serde_json::from_value(state.clone())?;
        *self.pending.borrow_mut() = recovered;
        Ok(())
    }
}
