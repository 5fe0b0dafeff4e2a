//! In-process topic broker.
//!
//! Every activity owns one [`Broker`]. Publishing routes a message through an
//! exchange to the queues bound to it and hands it synchronously to their
//! consumers, so a whole chain of reactions runs inside a single `publish`.

pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod shovel;
pub mod state;

pub use engine::{Broker, Handler, Routed, SubscribeOptions, WeakBroker};
pub use exchange::{ExchangeType, matches};
pub use message::{Content, Fields, Message, Parent, ParentRef, Properties, Source};
pub use queue::{ConsumerInfo, QueueOptions};
pub use shovel::{ShovelSource, Transform};
pub use state::BrokerState;
