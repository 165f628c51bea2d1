//! Warren - an AMQP-style message broker core
//!
//! Exchanges route published messages into queues through their bindings,
//! and queues dispatch to consumers fairly with at-least-once delivery.
//! Clients talk to the broker through in-process [`Connection`] handles.

mod broker;
pub mod config;
mod connection;
pub mod domain;
pub mod error;
pub mod logging;

pub use broker::Broker;
pub use config::{BrokerConfig, StoreConfig, StoreKind};
pub use connection::{ConsumeOptions, Connection};
pub use error::{BrokerError, ErrorKind};

pub use warren_core::{Consumer, MemoryStore, MessageStore, QueueStats, SledStore};
pub use warren_internals::{Delivery, ExchangeKind, MessageProperties, QueueOptions};
pub use warren_router::ExchangeInfo;
