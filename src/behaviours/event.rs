//! Start, intermediate and end events.
//!
//! Without event definitions the event completes right away. Otherwise the
//! definitions run through [`EventDefinitionExecution`] and the first one to
//! complete completes the event.

use std::rc::Rc;

use serde_json::Value;

use crate::activity::{Activity, ActivityDefinition, Behaviour};
use crate::broker::{Message, Properties};
use crate::event_definitions::EventDefinitionExecution;
use crate::utils::Result;

pub struct EventBehaviour {
    execution: Option<Rc<EventDefinitionExecution>>,
}

impl EventBehaviour {
    pub fn new(definition: &ActivityDefinition) -> Rc<Self> {
        let execution = (!definition.event_definitions.is_empty())
            .then(|| EventDefinitionExecution::new(definition.event_definitions.clone(), "execute.completed"));
        Rc::new(Self { execution })
    }
}

impl Behaviour for EventBehaviour {
    fn execute(self: Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        match &self.execution {
            Some(execution) => execution.execute(activity, message),
            None if message.content.is_root_scope => {
                activity.publish_execution("execute.completed", message.content.clone(), Properties::default())?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn get_state(&self, _activity: &Activity) -> Option<Value> {
        self.execution.as_ref().and_then(|execution| execution.get_state())
    }

    fn recover(&self, _activity: &Activity, state: &Value) -> Result<()> {
        match &self.execution {
            Some(execution) => execution.recover(state),
            None => Ok(()),
        }
    }
}
