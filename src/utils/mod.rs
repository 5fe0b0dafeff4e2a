//! The `utils` module provides shared definitions used across `popflow`.
//!
//! - `error`: the error taxonomy (broker misuse, engine failures and the
//!   serialisable domain `ActivityError`).
//! - `logging`: tracing subscriber initialisation.

pub mod error;
pub mod logging;

pub use error::{ActivityError, BrokerError, EngineError, Result};

#[cfg(test)]
mod tests;
