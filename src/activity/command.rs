//! Command channel
//!
//! Commands travel on the `api` exchange as `activity.<command>.<executionId>`
//! with the command payload in `content.message`.

use serde_json::Value;

use crate::broker::{Broker, Content, Message, Properties, Routed};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Signal(Option<Value>),
    Error(Option<Value>),
    Cancel(Option<Value>),
    Discard(Option<Value>),
    Stop,
    Throw(Option<Value>),
}

impl Command {
    /// Parse from `properties.type`, falling back to the command segment of
    /// the routing key. Unknown commands yield `None`.
    pub fn from_message(message: &Message) -> Option<Self> {
        let kind = match message.properties.kind.as_deref() {
            Some(kind) => kind,
            None => message.fields.routing_key.split('.').nth(1)?,
        };
        let payload = message.content.message.clone();
        Some(match kind {
            "signal" => Self::Signal(payload),
            "error" => Self::Error(payload),
            "cancel" => Self::Cancel(payload),
            "discard" => Self::Discard(payload),
            "stop" => Self::Stop,
            "throw" => Self::Throw(payload),
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Error(_) => "error",
            Self::Cancel(_) => "cancel",
            Self::Discard(_) => "discard",
            Self::Stop => "stop",
            Self::Throw(_) => "throw",
        }
    }
}

/// Sends commands to one execution through a broker's `api` exchange.
#[derive(Debug, Clone)]
pub struct ActivityApi {
    broker: Broker,
    content: Content,
}

impl ActivityApi {
    pub fn new(broker: &Broker, content: Content) -> Self {
        Self {
            broker: broker.clone(),
            content,
        }
    }

    pub fn execution_id(&self) -> &str {
        self.content.execution_id()
    }

    pub fn signal(&self, payload: Value) -> Result<Routed> {
        self.send("signal", Some(payload))
    }

    pub fn error(&self, payload: Value) -> Result<Routed> {
        self.send("error", Some(payload))
    }

    pub fn cancel(&self, payload: Option<Value>) -> Result<Routed> {
        self.send("cancel", payload)
    }

    pub fn discard(&self, payload: Option<Value>) -> Result<Routed> {
        self.send("discard", payload)
    }

    pub fn stop(&self) -> Result<Routed> {
        self.send("stop", None)
    }

    pub fn send(&self, command: &str, payload: Option<Value>) -> Result<Routed> {
        let mut content = self.content.clone();
        content.message = payload;
        self.broker.publish(
            "api",
            &format!("activity.{command}.{}", self.content.execution_id()),
            content,
            Properties::typed(command),
        )
    }
}
