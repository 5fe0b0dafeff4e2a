//! Multi-instance loop controller
//!
//! Iterations are sub-executions `<rootExecutionId>_<index>` of the looped
//! activity, started all at once or one after another. Their outputs are
//! collected in index order into the root completion.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::activity::{Activity, Command};
use crate::broker::{Broker, Content, Message, Properties, SubscribeOptions};
use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCharacteristics {
    pub cardinality: usize,
    pub is_sequential: bool,
}

impl LoopCharacteristics {
    pub fn sequential(cardinality: usize) -> Self {
        Self {
            cardinality,
            is_sequential: true,
        }
    }

    pub fn parallel(cardinality: usize) -> Self {
        Self {
            cardinality,
            is_sequential: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopProgress {
    root: Content,
    started: usize,
    outputs: BTreeMap<usize, Value>,
    finished: usize,
}

#[derive(Debug)]
pub struct LoopExecution {
    characteristics: LoopCharacteristics,
    progress: RefCell<BTreeMap<String, LoopProgress>>,
}

impl LoopExecution {
    pub fn new(characteristics: LoopCharacteristics) -> Rc<Self> {
        Rc::new(Self {
            characteristics,
            progress: RefCell::new(BTreeMap::new()),
        })
    }

    fn execute_tag(execution_id: &str) -> String {
        format!("_loop-execute-{execution_id}")
    }

    fn api_tag(execution_id: &str) -> String {
        format!("_loop-api-{execution_id}")
    }

    /// Start iterating for a root `execute.start`. A redelivered root only
    /// re-attaches; pending iterations are redelivered on their own.
    pub fn execute(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let content = &message.content;
        let execution_id = content.execution_id().to_string();
        self.progress
            .borrow_mut()
            .entry(execution_id.clone())
            .or_default()
            .root = content.clone();
        self.listen(activity, &execution_id)?;

        if message.fields.redelivered {
            return Ok(());
        }
        if self.characteristics.cardinality == 0 {
            return self.complete(activity, &execution_id);
        }

        let batch = if self.characteristics.is_sequential {
            1
        } else {
            self.characteristics.cardinality
        };
        for _ in 0..batch {
            self.start_next(activity, &execution_id)?;
        }
        Ok(())
    }

    fn listen(self: &Rc<Self>, activity: &Activity, execution_id: &str) -> Result<()> {
        let broker = activity.broker();
        if broker.get_consumer(&Self::execute_tag(execution_id)).is_some() {
            return Ok(());
        }

        let (looped, weak, root) = (Rc::clone(self), activity.downgrade(), execution_id.to_string());
        broker.subscribe_tmp(
            "execution",
            "execute.#",
            move |routing_key, message, _| match weak.upgrade() {
                Some(activity) => looped.on_iteration_message(&activity, &root, routing_key, message),
                None => Ok(()),
            },
            SubscribeOptions::new()
                .consumer_tag(Self::execute_tag(execution_id))
                .no_ack()
                .priority(300),
        )?;

        let (looped, weak, root) = (Rc::clone(self), activity.downgrade(), execution_id.to_string());
        broker.subscribe_tmp(
            "api",
            &format!("activity.*.{execution_id}"),
            move |_, message, _| match weak.upgrade() {
                Some(activity) => looped.on_api_message(&activity, &root, message),
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

    fn start_next(&self, activity: &Activity, execution_id: &str) -> Result<()> {
        let iteration = {
            let mut progress = self.progress.borrow_mut();
            let Some(progress) = progress.get_mut(execution_id) else {
                return Ok(());
            };
            if progress.started >= self.characteristics.cardinality {
                return Ok(());
            }
            let index = progress.started;
            progress.started += 1;

            let mut iteration = progress.root.clone();
            iteration.is_root_scope = false;
            iteration.index = Some(index);
            iteration.execution_id = Some(format!("{execution_id}_{index}"));
            iteration.parent = Some(progress.root.unshift_parent());
            iteration
        };
        debug!(activity = activity.id(), execution_id = iteration.execution_id(), "start iteration");
        activity.publish_execution("execute.start", iteration, Properties::default())?;
        Ok(())
    }

    fn on_iteration_message(&self, activity: &Activity, execution_id: &str, routing_key: &str, message: &Message) -> Result<()> {
        let content = &message.content;
        if content.is_root_scope || content.parent_execution_id() != Some(execution_id) {
            return Ok(());
        }
        let Some(index) = content.index else {
            return Ok(());
        };

        match routing_key {
            "execute.completed" | "execute.discard" => {
                let done = {
                    let mut progress = self.progress.borrow_mut();
                    let Some(progress) = progress.get_mut(execution_id) else {
                        return Ok(());
                    };
                    progress
                        .outputs
                        .insert(index, content.output.clone().unwrap_or(Value::Null));
                    progress.finished += 1;
                    progress.finished >= self.characteristics.cardinality
                };
                if done {
                    self.complete(activity, execution_id)
                } else if self.characteristics.is_sequential {
                    self.start_next(activity, execution_id)
                } else {
                    Ok(())
                }
            }
            "execute.error" => {
                let Some(progress) = self.progress.borrow_mut().remove(execution_id) else {
                    return Ok(());
                };
                Self::stop_listening(activity.broker(), execution_id);
                let mut failed = progress.root;
                failed.error = content.error.clone();
                activity.publish_execution("execute.error", failed, Properties::default())?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn complete(&self, activity: &Activity, execution_id: &str) -> Result<()> {
        let Some(progress) = self.progress.borrow_mut().remove(execution_id) else {
            return Ok(());
        };
        Self::stop_listening(activity.broker(), execution_id);

        let mut completed = progress.root;
        completed.output = Some(Value::Array(progress.outputs.into_values().collect()));
        activity.publish_execution("execute.completed", completed, Properties::default())?;
        Ok(())
    }

    fn on_api_message(&self, activity: &Activity, execution_id: &str, message: &Message) -> Result<()> {
        let command = match Command::from_message(message) {
            Some(Command::Stop) => "stop",
            Some(Command::Discard(_)) => "discard",
            _ => return Ok(()),
        };
        let broker = activity.broker();
        Self::stop_listening(broker, execution_id);

        let running: Vec<usize> = {
            let progress = self.progress.borrow();
            let Some(progress) = progress.get(execution_id) else {
                return Ok(());
            };
            (0..progress.started)
                .filter(|index| !progress.outputs.contains_key(index))
                .collect()
        };
        for index in running {
            let iteration = format!("{execution_id}_{index}");
            broker.publish(
                "api",
                &format!("activity.{command}.{iteration}"),
                Content {
                    execution_id: Some(iteration.clone()),
                    ..Content::default()
                },
                Properties::typed(command),
            )?;
        }
        if command == "discard" {
            self.progress.borrow_mut().remove(execution_id);
        }
        Ok(())
    }

    pub fn get_state(&self) -> Option<Value> {
        let progress = self.progress.borrow();
        if progress.is_empty() {
            return None;
        }
        serde_json::to_value(&*progress).ok()
    }

    pub fn recover(&self, state: &Value) -> Result<()> {
        *self.progress.borrow_mut() = serde_json::from_value(state.clone())?;
        Ok(())
    }
}
