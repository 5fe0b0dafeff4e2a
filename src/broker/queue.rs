//! Queues and consumers
//!
//! A `Queue` buffers routed messages in arrival order. Messages handed to an
//! acknowledging consumer stay in the queue, marked with that consumer's tag,
//! until they are acked, nacked or the consumer is cancelled.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::broker::engine::Handler;
use crate::broker::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

impl QueueOptions {
    /// Non-durable queue removed together with its last consumer.
    pub fn temporary() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub delivery_tag: u64,
    /// Consumer currently holding the message unacked.
    pub consumer: Option<String>,
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    pub(crate) messages: VecDeque<QueuedMessage>,
    /// Consumer tags ordered by descending priority, then registration.
    pub(crate) consumers: Vec<(String, i32)>,
}

impl Queue {
    pub fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            messages: VecDeque::new(),
            consumers: Vec::new(),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn add_consumer(&mut self, tag: &str, priority: i32) {
        let position = self
            .consumers
            .iter()
            .position(|(_, p)| *p < priority)
            .unwrap_or(self.consumers.len());
        self.consumers.insert(position, (tag.to_string(), priority));
    }

    pub(crate) fn remove_consumer(&mut self, tag: &str) {
        self.consumers.retain(|(t, _)| t != tag);
    }

    pub(crate) fn unacked_by(&self, tag: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.consumer.as_deref() == Some(tag))
            .count()
    }

    /// Release everything held by `tag` back to the queue as redelivered.
    pub(crate) fn requeue_from(&mut self, tag: &str) -> usize {
        let mut count = 0;
        for queued in self
            .messages
            .iter_mut()
            .filter(|m| m.consumer.as_deref() == Some(tag))
        {
            queued.consumer = None;
            queued.message.fields.redelivered = true;
            count += 1;
        }
        count
    }

    pub(crate) fn position_of(&self, consumer: &str, delivery_tag: u64) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.delivery_tag == delivery_tag && m.consumer.as_deref() == Some(consumer))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub no_ack: bool,
    pub priority: i32,
    pub prefetch: usize,
    /// Cancel after the first delivery.
    pub once: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            no_ack: false,
            priority: 0,
            prefetch: 1,
            once: false,
        }
    }
}

pub(crate) struct Consumer {
    pub tag: String,
    pub queue: String,
    pub handler: Handler,
    pub options: ConsumerOptions,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish()
    }
}

/// Public description of an active consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_tag: String,
    pub queue: String,
    #[serde(flatten)]
    pub options: ConsumerOptions,
}
