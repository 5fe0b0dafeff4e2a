//! The `error` module defines the error types used within `popflow`.
//!
//! Three families are kept apart by how they travel:
//!
//! - [`BrokerError`] is topology misuse (unknown exchange, duplicate consumer
//!   tag, ...). It is returned from broker calls and aborts the surrounding
//!   operation.
//! - [`EngineError`] is everything the engine itself can fail with, including
//!   broker misuse, (de)serialisation and persistence failures.
//! - [`ActivityError`] is a domain error. It never crosses the broker boundary
//!   as a Rust error; it is serialised into `content.error` of an
//!   `execute.error` message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::exchange::ExchangeType;
use crate::broker::message::{Content, Source};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("exchange '{0}' does not exist")]
    UnknownExchange(String),

    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("exchange '{name}' is declared as {existing:?}, not {requested:?}")]
    ExchangeTypeMismatch {
        name: String,
        existing: ExchangeType,
        requested: ExchangeType,
    },

    #[error("consumer tag '{0}' is already in use")]
    DuplicateConsumerTag(String),

    #[error("shovel '{0}' already exists")]
    DuplicateShovel(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("cannot recover state of '{found}' into activity '{expected}'")]
    StateMismatch { expected: String, found: String },

    #[error("activity '{0}' is already running")]
    AlreadyRunning(String),
}

/// Domain-level execution error carried by `execute.error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{name}: {message}")]
pub struct ActivityError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Execution that failed.
    #[serde(rename = "source", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Source>,
    /// Original command payload, if the error was raised by a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Value>,
}

impl ActivityError {
    pub fn new(message: impl Into<String>, origin: &Content, inner: Option<Value>) -> Self {
        let code = inner
            .as_ref()
            .and_then(|payload| payload.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            name: "ActivityError".to_string(),
            message: message.into(),
            code,
            origin: Some(Source::from_content(origin)),
            inner,
        }
    }

    /// Build the error from a command payload; a string payload or a
    /// `message` field become the error message.
    pub fn from_payload(origin: &Content, payload: Option<Value>) -> Self {
        let message = match payload.as_ref() {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("activity error")
                .to_string(),
            None => "activity error".to_string(),
        };
        Self::new(message, origin, payload)
    }

    pub fn to_value(&self) -> Value {
        // plain data, serialisation cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
