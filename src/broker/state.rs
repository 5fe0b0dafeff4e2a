//! Broker snapshots
//!
//! `get_state` captures what is needed to rebuild routing for a stopped
//! activity: every exchange, bindings to durable queues, durable queues with
//! their messages and a description of the consumers attached to them.
//! Handlers are code and are not captured; the owner re-attaches them after
//! `recover`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::broker::engine::Broker;
use crate::broker::exchange::ExchangeType;
use crate::broker::message::Message;
use crate::broker::queue::{ConsumerInfo, Queue, QueueOptions, QueuedMessage};
use crate::utils::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerState {
    pub exchanges: Vec<ExchangeState>,
    pub queues: Vec<QueueState>,
    #[serde(default)]
    pub consumers: Vec<ConsumerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeState {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    #[serde(default)]
    pub bindings: Vec<BindingState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingState {
    pub queue: String,
    pub pattern: String,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub name: String,
    #[serde(flatten)]
    pub options: QueueOptions,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl BrokerState {
    pub fn queue(&self, name: &str) -> Option<&QueueState> {
        self.queues.iter().find(|q| q.name == name)
    }
}

impl Broker {
    /// Snapshot of the durable topology. Messages held unacked by a consumer
    /// are captured as redelivered.
    pub fn get_state(&self) -> BrokerState {
        let inner = self.inner.borrow();
        let durable = |queue: &str| inner.queues.get(queue).is_some_and(|q| q.options.durable);

        let exchanges = inner
            .exchanges
            .values()
            .map(|exchange| ExchangeState {
                name: exchange.name.clone(),
                kind: exchange.kind,
                bindings: exchange
                    .bindings()
                    .iter()
                    .filter(|b| durable(&b.queue))
                    .map(|b| BindingState {
                        queue: b.queue.clone(),
                        pattern: b.pattern.clone(),
                        priority: b.priority,
                    })
                    .collect(),
            })
            .collect();

        let queues = inner
            .queues
            .values()
            .filter(|q| q.options.durable)
            .map(|queue| QueueState {
                name: queue.name.clone(),
                options: queue.options,
                messages: queue
                    .messages
                    .iter()
                    .map(|queued| {
                        let mut message = queued.message.clone();
                        if queued.consumer.is_some() {
                            message.fields.redelivered = true;
                        }
                        message.fields.consumer_tag = None;
                        message.fields.delivery_tag = None;
                        message
                    })
                    .collect(),
            })
            .collect();

        let mut consumers: Vec<ConsumerInfo> = inner
            .consumers
            .values()
            .filter(|c| durable(&c.queue))
            .map(|c| ConsumerInfo {
                consumer_tag: c.tag.clone(),
                queue: c.queue.clone(),
                options: c.options,
            })
            .collect();
        consumers.sort_by(|a, b| a.consumer_tag.cmp(&b.consumer_tag));

        BrokerState {
            exchanges,
            queues,
            consumers,
        }
    }

    /// Rebuild exchanges, durable queues, their messages and bindings.
    /// Queue contents are replaced by the snapshot's.
    pub fn recover(&self, state: &BrokerState) -> Result<()> {
        for exchange in &state.exchanges {
            self.assert_exchange(&exchange.name, exchange.kind)?;
        }

        for queue in &state.queues {
            let mut inner = self.inner.borrow_mut();
            let mut restored = VecDeque::with_capacity(queue.messages.len());
            for message in &queue.messages {
                let delivery_tag = inner.next_seq();
                restored.push_back(QueuedMessage {
                    message: message.clone(),
                    delivery_tag,
                    consumer: None,
                });
            }
            let target = inner
                .queues
                .entry(queue.name.clone())
                .or_insert_with(|| Queue::new(&queue.name, queue.options));
            target.messages = restored;
        }

        for exchange in &state.exchanges {
            for binding in &exchange.bindings {
                self.bind_queue(&binding.queue, &exchange.name, &binding.pattern, binding.priority)?;
            }
        }

        for queue in &state.queues {
            self.drain(&queue.name)?;
        }
        Ok(())
    }
}
