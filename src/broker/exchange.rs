//! Exchange management
//!
//! An `Exchange` routes published messages to queues through its bindings.
//! Bindings are kept ordered by descending priority, then by the order they
//! were added, which is the order a publish visits them in.
//!
//! `topic` exchanges compare `.`-delimited segments where `*` stands for
//! exactly one segment and `#` for zero or more. `direct` exchanges compare
//! the whole routing key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Topic,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
    pub priority: i32,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bindings: Vec::new(),
        }
    }

    /// Add a binding. Binding the same queue with the same pattern twice is a no-op.
    pub fn bind(&mut self, binding: Binding) {
        if self.has_binding(&binding.queue, &binding.pattern) {
            return;
        }
        let position = self
            .bindings
            .iter()
            .position(|b| b.priority < binding.priority)
            .unwrap_or(self.bindings.len());
        self.bindings.insert(position, binding);
    }

    pub fn unbind(&mut self, queue: &str, pattern: &str) {
        self.bindings
            .retain(|b| !(b.queue == queue && b.pattern == pattern));
    }

    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    pub fn has_binding(&self, queue: &str, pattern: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Bindings matching `routing_key`, in delivery order.
    pub fn routes(&self, routing_key: &str) -> Vec<Binding> {
        self.bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeType::Topic => matches(&b.pattern, routing_key),
                ExchangeType::Direct => b.pattern == routing_key,
            })
            .cloned()
            .collect()
    }
}

/// Topic pattern match.
///
/// `activity.#` matches `activity`, `activity.end` and `activity.wait.signal`;
/// `activity.*` matches `activity.end` only.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => key.first() == Some(segment) && match_segments(rest, &key[1..]),
    }
}
