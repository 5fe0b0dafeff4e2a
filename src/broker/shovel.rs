//! Shovels
//!
//! A shovel is a temporary subscription on a source exchange whose handler
//! republishes every delivery into an exchange of another broker, optionally
//! through a transform. The destination is held weakly: once it is dropped
//! the shovel forwards nothing.

use std::rc::Rc;

use tracing::debug;

use crate::broker::engine::{Broker, SubscribeOptions};
use crate::broker::message::Message;
use crate::utils::{BrokerError, Result};

pub type Transform = Rc<dyn Fn(&Message) -> Message>;

#[derive(Debug, Clone)]
pub struct ShovelSource {
    pub exchange: String,
    pub pattern: String,
    pub priority: i32,
}

impl ShovelSource {
    pub fn new(exchange: &str, pattern: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl Broker {
    /// Forward `source` of this broker into `exchange` of `destination`.
    pub fn create_shovel(
        &self,
        name: &str,
        source: ShovelSource,
        destination: &Broker,
        exchange: &str,
        transform: Option<Transform>,
    ) -> Result<()> {
        if self.has_shovel(name) {
            return Err(BrokerError::DuplicateShovel(name.to_string()).into());
        }
        if !destination.has_exchange(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()).into());
        }

        let target = destination.downgrade();
        let target_exchange = exchange.to_string();
        let shovel = name.to_string();
        let tag = self.subscribe_tmp(
            &source.exchange,
            &source.pattern,
            move |_, message, _| {
                let Some(target) = target.upgrade() else {
                    debug!(shovel = %shovel, "destination broker dropped");
                    return Ok(());
                };
                let forwarded = match &transform {
                    Some(transform) => transform(message),
                    None => message.clone(),
                };
                target.publish(
                    &target_exchange,
                    &forwarded.fields.routing_key,
                    forwarded.content,
                    forwarded.properties,
                )?;
                Ok(())
            },
            SubscribeOptions::new()
                .consumer_tag(format!("smq.shovel-{name}"))
                .priority(source.priority)
                .no_ack(),
        )?;

        debug!(
            broker = %self.owner(),
            shovel = name,
            source = %source.exchange,
            pattern = %source.pattern,
            destination = %destination.owner(),
            exchange,
            "shovel created"
        );
        self.inner
            .borrow_mut()
            .shovels
            .insert(name.to_string(), tag);
        Ok(())
    }

    /// Stop forwarding. Closing an unknown or already closed shovel is a no-op.
    pub fn close_shovel(&self, name: &str) -> bool {
        let tag = self.inner.borrow_mut().shovels.remove(name);
        match tag {
            Some(tag) => {
                self.cancel(&tag);
                debug!(broker = %self.owner(), shovel = name, "shovel closed");
                true
            }
            None => false,
        }
    }

    /// Whether a shovel named `name` is active.
    pub fn has_shovel(&self, name: &str) -> bool {
        self.inner.borrow().shovels.contains_key(name)
    }
}
