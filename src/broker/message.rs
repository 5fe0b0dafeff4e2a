//! Message definitions for the broker
//!
//! `Message` is the envelope carried by every broker interaction: delivery
//! `fields`, execution `content` and publish `properties`.
//!
//! Notes on fields:
//! - `fields.routing_key`/`fields.exchange`: where the message was published
//! - `fields.redelivered`: set when a delivery was returned to its queue
//!   (consumer cancelled before acking, or state recovered) and delivered again
//! - `fields.consumer_tag`/`fields.delivery_tag`: identify the delivery for
//!   `ack`/`nack`
//! - `properties.type`: command or event subtype (`signal`, `cancel`, ...)
//! - `properties.mandatory`: report the publish as unroutable if no queue
//!   matched
//!
//! Content is cloned for every queue it is routed to, so a consumer can never
//! observe another consumer's copy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fields {
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_tag: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Properties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mandatory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    /// Published on behalf of an enclosing scope (thrown errors, signals).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delegate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Properties {
    pub fn typed(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn mandatory() -> Self {
        Self {
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn delegated(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            delegate: true,
            ..Self::default()
        }
    }
}

/// Reference to an enclosing scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParentRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Enclosing scope of an execution, with the path further out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Parent {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ParentRef>,
}

/// Execution that produced a message, e.g. the activity that threw an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl Source {
    pub fn from_content(content: &Content) -> Self {
        Self {
            id: content.id.clone(),
            kind: content.kind.clone(),
            execution_id: content.execution_id.clone(),
        }
    }
}

/// Execution content record.
///
/// The well known fields are typed; anything else a collaborator attaches
/// travels in `extra` and survives serialisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_root_scope: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_definition_scope: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Command payload or thrown descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_activity: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_routing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_transaction: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn execution_id(&self) -> &str {
        self.execution_id.as_deref().unwrap_or_default()
    }

    pub fn parent_execution_id(&self) -> Option<&str> {
        self.parent.as_ref().and_then(|p| p.execution_id.as_deref())
    }

    /// The same content as seen from the enclosing scope: the parent becomes
    /// the execution and the first path entry becomes the parent.
    pub fn shift_parent(&self) -> Content {
        let mut shifted = self.clone();
        let Some(parent) = &self.parent else {
            return shifted;
        };

        shifted.execution_id = parent.execution_id.clone();
        shifted.parent = parent.path.split_first().map(|(first, rest)| Parent {
            id: first.id.clone(),
            execution_id: first.execution_id.clone(),
            path: rest.to_vec(),
        });
        shifted
    }

    /// Parent reference for a scope nested inside this execution.
    pub fn unshift_parent(&self) -> Parent {
        let mut path = Vec::new();
        if let Some(parent) = &self.parent {
            path.push(ParentRef {
                id: parent.id.clone(),
                execution_id: parent.execution_id.clone(),
            });
            path.extend(parent.path.iter().cloned());
        }

        Parent {
            id: self.id.clone().unwrap_or_default(),
            execution_id: self.execution_id.clone(),
            path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub fields: Fields,
    pub content: Content,
    pub properties: Properties,
}

impl Message {
    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }
}
