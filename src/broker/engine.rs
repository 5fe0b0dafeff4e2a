use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::exchange::{Binding, Exchange, ExchangeType};
use crate::broker::message::{Content, Fields, Message, Properties};
use crate::broker::queue::{Consumer, ConsumerInfo, ConsumerOptions, Queue, QueueOptions, QueuedMessage};
use crate::utils::{BrokerError, Result};

/// Message handler: `(routing_key, message, broker)`.
///
/// Handlers run synchronously inside the publish, ack or cancel call that
/// delivered the message. Errors abort that call and travel back to its caller.
pub type Handler = Rc<dyn Fn(&str, &Message, &Broker) -> Result<()>>;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Number of queues the message was routed to.
    Queued(usize),
    /// Mandatory message that matched no binding.
    Unroutable,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub consumer_tag: Option<String>,
    pub no_ack: bool,
    pub priority: i32,
    pub prefetch: Option<usize>,
}

impl SubscribeOptions {
    /// Ack-mode options with prefetch 1 and priority 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag for the consumer; generated when not set.
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Binding priority for temporary subscriptions, consumer priority
    /// within a queue.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Deliveries are settled on hand-over and ignore prefetch.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Upper bound of unacked deliveries held by the consumer.
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    fn consumer_options(&self, once: bool) -> ConsumerOptions {
        ConsumerOptions {
            no_ack: self.no_ack || once,
            priority: self.priority,
            prefetch: self.prefetch.unwrap_or(1).max(1),
            once,
        }
    }
}

#[derive(Default)]
pub(super) struct BrokerInner {
    pub(super) owner: String,
    pub(super) exchanges: BTreeMap<String, Exchange>,
    pub(super) queues: BTreeMap<String, Queue>,
    pub(super) consumers: HashMap<String, Consumer>,
    /// Shovel name to the consumer tag forwarding for it.
    pub(super) shovels: HashMap<String, String>,
    seq: u64,
}

impl BrokerInner {
    pub(super) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn bind(&mut self, queue: &str, exchange: &str, pattern: &str, priority: i32) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()).into());
        }
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        target.bind(Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
            priority,
        });
        Ok(())
    }

    fn register(&mut self, tag: &str, queue: &str, handler: Handler, options: ConsumerOptions) -> Result<()> {
        if self.consumers.contains_key(tag) {
            return Err(BrokerError::DuplicateConsumerTag(tag.to_string()).into());
        }
        let target = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        target.add_consumer(tag, options.priority);
        self.consumers.insert(
            tag.to_string(),
            Consumer {
                tag: tag.to_string(),
                queue: queue.to_string(),
                handler,
                options,
            },
        );
        Ok(())
    }

    fn enqueue(&mut self, exchange: &str, binding: &Binding, message: Message) -> bool {
        let bound = self
            .exchanges
            .get(exchange)
            .is_some_and(|e| e.has_binding(&binding.queue, &binding.pattern));
        if !bound {
            return false;
        }
        let delivery_tag = self.next_seq();
        let Some(queue) = self.queues.get_mut(&binding.queue) else {
            return false;
        };
        queue.messages.push_back(QueuedMessage {
            message,
            delivery_tag,
            consumer: None,
        });
        true
    }

    /// Pick the next pending message of `queue` and the consumer it goes to.
    fn next_delivery(&mut self, queue_name: &str) -> Option<(Handler, Message)> {
        let queue = self.queues.get_mut(queue_name)?;
        let index = queue.messages.iter().position(|m| m.consumer.is_none())?;
        let tag = queue
            .consumers
            .iter()
            .map(|(tag, _)| tag)
            .find(|tag| {
                self.consumers.get(tag.as_str()).is_some_and(|c| {
                    c.options.no_ack || queue.unacked_by(tag) < c.options.prefetch
                })
            })?
            .clone();

        let consumer = self.consumers.get(&tag)?;
        let handler = consumer.handler.clone();
        let options = consumer.options;

        let queued = &mut queue.messages[index];
        let mut message = queued.message.clone();
        message.fields.consumer_tag = Some(tag.clone());
        message.fields.delivery_tag = Some(queued.delivery_tag);
        if options.no_ack {
            queue.messages.remove(index);
        } else {
            queued.consumer = Some(tag.clone());
        }

        if options.once {
            self.remove_consumer(&tag);
        }
        Some((handler, message))
    }

    /// Remove a consumer, returning its queue. Unacked messages go back to
    /// the queue flagged as redelivered.
    pub(super) fn remove_consumer(&mut self, tag: &str) -> Option<String> {
        let consumer = self.consumers.remove(tag)?;
        let mut delete = false;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.remove_consumer(tag);
            queue.requeue_from(tag);
            delete = queue.options.auto_delete && queue.consumers.is_empty();
        }
        if delete {
            self.delete_queue(&consumer.queue);
        }
        Some(consumer.queue)
    }

    pub(super) fn delete_queue(&mut self, name: &str) -> bool {
        if self.queues.remove(name).is_none() {
            return false;
        }
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }
        self.consumers.retain(|_, c| c.queue != name);
        true
    }
}

/// In-process topic broker owned by one activity.
///
/// `Broker` is a cheap handle; clones share the same exchanges, queues and
/// consumers. It is deliberately `!Send`: all routing happens on the thread
/// that owns the activity.
#[derive(Clone)]
pub struct Broker {
    pub(super) inner: Rc<RefCell<BrokerInner>>,
}

/// Non-owning handle, used by shovels and by closures that must not keep
/// their activity alive.
#[derive(Clone)]
pub struct WeakBroker {
    inner: Weak<RefCell<BrokerInner>>,
}

impl WeakBroker {
    /// `None` once the broker has been dropped.
    pub fn upgrade(&self) -> Option<Broker> {
        self.inner.upgrade().map(|inner| Broker { inner })
    }
}

impl Broker {
    /// Empty broker. `owner` only labels log lines and states.
    pub fn new(owner: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BrokerInner {
                owner: owner.to_string(),
                ..BrokerInner::default()
            })),
        }
    }

    /// Id of the activity owning the broker.
    pub fn owner(&self) -> String {
        self.inner.borrow().owner.clone()
    }

    /// Handle for shovels and handlers that must not keep the broker alive.
    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether both handles point to the same broker.
    pub fn ptr_eq(&self, other: &Broker) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create the exchange if absent. Re-asserting with another type fails.
    pub fn assert_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let existing = inner.exchanges.get(name).map(|e| e.kind);
        match existing {
            Some(existing) if existing != kind => Err(BrokerError::ExchangeTypeMismatch {
                name: name.to_string(),
                existing,
                requested: kind,
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                debug!(broker = %inner.owner, exchange = name, ?kind, "exchange asserted");
                inner.exchanges.insert(name.to_string(), Exchange::new(name, kind));
                Ok(())
            }
        }
    }

    /// Whether an exchange named `name` exists.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.borrow().exchanges.contains_key(name)
    }

    /// Create the queue if absent.
    pub fn assert_queue(&self, name: &str, options: QueueOptions) {
        self.inner
            .borrow_mut()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(name, options));
    }

    /// Remove the queue with its bindings and consumers. Returns `false`
    /// for an unknown queue.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.inner.borrow_mut().delete_queue(name)
    }

    /// Drop messages no consumer is holding.
    pub fn purge_queue(&self, name: &str) -> usize {
        let mut inner = self.inner.borrow_mut();
        let Some(queue) = inner.queues.get_mut(name) else {
            return 0;
        };
        let before = queue.messages.len();
        queue.messages.retain(|m| m.consumer.is_some());
        before - queue.messages.len()
    }

    /// Route messages matching `pattern` on `exchange` into `queue`.
    /// Bindings are visited by descending priority, then in binding order.
    /// Binding the same queue and pattern twice is a no-op.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str, priority: i32) -> Result<()> {
        self.inner.borrow_mut().bind(queue, exchange, pattern, priority)
    }

    /// Remove a binding. Unknown bindings are ignored.
    pub fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        if let Some(target) = self.inner.borrow_mut().exchanges.get_mut(exchange) {
            target.unbind(queue, pattern);
        }
    }

    /// Route `content` to every queue bound with a matching pattern.
    ///
    /// Bindings are visited in priority order and each queue is drained before
    /// the next binding receives its copy. A binding removed meanwhile is
    /// skipped.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Content,
        mut properties: Properties,
    ) -> Result<Routed> {
        let (owner, routes) = {
            let inner = self.inner.borrow();
            let target = inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            (inner.owner.clone(), target.routes(routing_key))
        };

        if properties.message_id.is_none() {
            properties.message_id = Some(format!("smq.mid-{}", Uuid::new_v4().simple()));
        }
        if properties.timestamp.is_none() {
            properties.timestamp = Some(Utc::now().timestamp_millis());
        }

        let message = Message {
            fields: Fields {
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
                ..Fields::default()
            },
            content,
            properties,
        };

        let mut queued = 0;
        for binding in routes {
            let enqueued = self
                .inner
                .borrow_mut()
                .enqueue(exchange, &binding, message.clone());
            if enqueued {
                queued += 1;
                self.drain(&binding.queue)?;
            }
        }

        if queued == 0 {
            if message.properties.mandatory {
                warn!(broker = %owner, exchange, routing_key, "mandatory message is unroutable");
                return Ok(Routed::Unroutable);
            }
            debug!(broker = %owner, exchange, routing_key, "no route");
        }
        Ok(Routed::Queued(queued))
    }

    /// Attach a consumer to an existing queue.
    pub fn consume(
        &self,
        queue: &str,
        handler: impl Fn(&str, &Message, &Broker) -> Result<()> + 'static,
        options: SubscribeOptions,
    ) -> Result<String> {
        let tag = options.consumer_tag.clone().unwrap_or_else(generate_tag);
        self.inner
            .borrow_mut()
            .register(&tag, queue, Rc::new(handler), options.consumer_options(false))?;
        self.drain(queue)?;
        Ok(tag)
    }

    /// Consume from a durable named queue bound to `exchange` with `pattern`.
    pub fn subscribe(
        &self,
        exchange: &str,
        pattern: &str,
        queue: &str,
        handler: impl Fn(&str, &Message, &Broker) -> Result<()> + 'static,
        options: SubscribeOptions,
    ) -> Result<String> {
        self.assert_queue(queue, QueueOptions::default());
        self.bind_queue(queue, exchange, pattern, options.priority)?;
        self.consume(queue, handler, options)
    }

    /// Consume through a private auto-deleting queue.
    pub fn subscribe_tmp(
        &self,
        exchange: &str,
        pattern: &str,
        handler: impl Fn(&str, &Message, &Broker) -> Result<()> + 'static,
        options: SubscribeOptions,
    ) -> Result<String> {
        self.subscribe_private(exchange, pattern, Rc::new(handler), options, false)
    }

    /// Like [`Broker::subscribe_tmp`], cancelled right before its first delivery
    /// is handled.
    pub fn subscribe_once(
        &self,
        exchange: &str,
        pattern: &str,
        handler: impl Fn(&str, &Message, &Broker) -> Result<()> + 'static,
        options: SubscribeOptions,
    ) -> Result<String> {
        self.subscribe_private(exchange, pattern, Rc::new(handler), options, true)
    }

    pub(super) fn subscribe_private(
        &self,
        exchange: &str,
        pattern: &str,
        handler: Handler,
        options: SubscribeOptions,
        once: bool,
    ) -> Result<String> {
        let tag = options.consumer_tag.clone().unwrap_or_else(generate_tag);
        let queue = format!("{tag}-q");
        {
            let mut inner = self.inner.borrow_mut();
            if inner.consumers.contains_key(&tag) {
                return Err(BrokerError::DuplicateConsumerTag(tag).into());
            }
            if !inner.exchanges.contains_key(exchange) {
                return Err(BrokerError::UnknownExchange(exchange.to_string()).into());
            }
            inner
                .queues
                .insert(queue.clone(), Queue::new(&queue, QueueOptions::temporary()));
            inner.bind(&queue, exchange, pattern, options.priority)?;
            inner.register(&tag, &queue, handler, options.consumer_options(once))?;
        }
        Ok(tag)
    }

    /// Cancel a consumer. Unknown tags are a no-op and return `false`, so
    /// teardown code may cancel speculatively and repeatedly.
    ///
    /// Messages the consumer held return to the queue as redelivered and are
    /// offered to the remaining consumers at once. A handler error during
    /// that redelivery is logged instead of returned and ends it; what is
    /// left waits for the next publish, ack or consume on the queue.
    pub fn cancel(&self, consumer_tag: &str) -> bool {
        let removed = self.inner.borrow_mut().remove_consumer(consumer_tag);
        let Some(queue) = removed else {
            return false;
        };
        debug!(broker = %self.owner(), consumer_tag, "consumer cancelled");
        if let Err(err) = self.drain(&queue) {
            error!(broker = %self.owner(), queue = %queue, %err, "redelivery after cancel failed");
        }
        true
    }

    /// Acknowledge a delivery. Deliveries that are no longer held are ignored.
    pub fn ack(&self, message: &Message) -> Result<()> {
        self.settle(message, false)
    }

    /// Reject a delivery, optionally returning it to its queue as redelivered.
    pub fn nack(&self, message: &Message, requeue: bool) -> Result<()> {
        self.settle(message, requeue)
    }

    fn settle(&self, message: &Message, requeue: bool) -> Result<()> {
        let (Some(tag), Some(delivery_tag)) = (
            message.fields.consumer_tag.as_deref(),
            message.fields.delivery_tag,
        ) else {
            return Ok(());
        };

        let queue_name = {
            let mut inner = self.inner.borrow_mut();
            let Some(queue_name) = inner.consumers.get(tag).map(|c| c.queue.clone()) else {
                return Ok(());
            };
            let Some(queue) = inner.queues.get_mut(&queue_name) else {
                return Ok(());
            };
            let Some(index) = queue.position_of(tag, delivery_tag) else {
                return Ok(());
            };
            if requeue {
                let queued = &mut queue.messages[index];
                queued.consumer = None;
                queued.message.fields.redelivered = true;
            } else {
                queue.messages.remove(index);
            }
            queue_name
        };
        self.drain(&queue_name)
    }

    pub(super) fn drain(&self, queue: &str) -> Result<()> {
        loop {
            let next = self.inner.borrow_mut().next_delivery(queue);
            let Some((handler, message)) = next else {
                return Ok(());
            };
            handler(&message.fields.routing_key, &message, self)?;
        }
    }

    /// Descriptor of the consumer tagged `consumer_tag`, if active.
    pub fn get_consumer(&self, consumer_tag: &str) -> Option<ConsumerInfo> {
        self.inner
            .borrow()
            .consumers
            .get(consumer_tag)
            .map(|c| ConsumerInfo {
                consumer_tag: c.tag.clone(),
                queue: c.queue.clone(),
                options: c.options,
            })
    }

    /// Number of active consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.borrow().consumers.len()
    }

    /// Messages in `queue`, delivered but unacked ones included. `None` for
    /// an unknown queue.
    pub fn queue_message_count(&self, queue: &str) -> Option<usize> {
        self.inner.borrow().queues.get(queue).map(Queue::message_count)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Broker")
            .field("owner", &inner.owner)
            .field("exchanges", &inner.exchanges.len())
            .field("queues", &inner.queues.len())
            .field("consumers", &inner.consumers.len())
            .finish()
    }
}

fn generate_tag() -> String {
    format!("smq.ctag-{}", Uuid::new_v4().simple())
}
