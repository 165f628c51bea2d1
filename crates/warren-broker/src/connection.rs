use std::sync::Arc;
use tracing::warn;
use warren_core::Consumer;
use warren_internals::{
    ConnectionId, Delivery, DeliveryTag, ExchangeKind, MessageProperties, QueueOptions,
};

use crate::broker::Shared;
use crate::error::BrokerError;

/// Consumer settings for [`Connection::consume`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Generated as `ctag-<uuid>` when absent.
    pub consumer_tag: Option<String>,
    pub auto_ack: bool,
    /// Outstanding deliveries allowed; `None` uses the broker default, `0` is unlimited.
    pub prefetch: Option<u16>,
}

impl ConsumeOptions {
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            ..Default::default()
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// A client's session with the broker.
///
/// Closing the connection, explicitly or by dropping it, cancels its
/// consumers, requeues every delivery it has not acknowledged and deletes
/// the exclusive queues it declared.
pub struct Connection {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open(self.id)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed(self.id))
        }
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.topology.declare_exchange(name, kind, durable)
    }

    pub fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.topology.delete_exchange(name)
    }

    /// Returns the queue name, generated when `name` is empty.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let exclusive = options.exclusive;
        let name = self.shared.topology.declare_queue(name, options, self.id)?;
        if exclusive {
            self.confirm_exclusive_queue(&name)?;
        }
        Ok(name)
    }

    /// Returns the number of ready messages discarded.
    pub fn delete_queue(&self, name: &str) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.shared.topology.delete_queue(name, self.id)
    }

    pub fn purge_queue(&self, name: &str) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.shared.topology.purge_queue(name, self.id)
    }

    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared
            .topology
            .bind_queue(queue, exchange, pattern, self.id)
    }

    pub fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared
            .topology
            .unbind_queue(queue, exchange, pattern, self.id)
    }

    /// Returns how many queues received the message; zero is not an error.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.shared
            .messages
            .publish(exchange, routing_key, payload.into(), properties)
    }

    pub fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        self.ensure_open()?;
        let consumer = self.shared.messages.consume(queue, self.id, options)?;
        self.confirm_consumer(consumer)
    }

    pub fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        let delivery = self.shared.messages.get(queue, self.id, auto_ack)?;
        self.confirm_get(delivery, auto_ack)
    }

    pub fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.messages.ack(self.id, delivery_tag)
    }

    /// Acknowledges `delivery_tag` and every earlier delivery on this connection.
    pub fn ack_multiple(&self, delivery_tag: DeliveryTag) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.shared.messages.ack_multiple(self.id, delivery_tag)
    }

    pub fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.messages.nack(self.id, delivery_tag, requeue)
    }

    /// Returns the number of unacknowledged deliveries put back on the queue.
    pub fn cancel(&self, consumer_tag: &str) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.shared.messages.cancel(self.id, consumer_tag)
    }

    pub fn close(&self) -> Result<(), BrokerError> {
        self.shared.close_connection(self.id)
    }

    // A close that ran between `ensure_open` and the registration below
    // never saw it, so state created on a closed connection is undone here.

    fn confirm_exclusive_queue(&self, name: &str) -> Result<(), BrokerError> {
        if self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.shared.topology.delete_queue(name, self.id) {
            warn!(connection_id = self.id, queue_name = %name, error = %e, "failed to drop exclusive queue of closed connection");
        }
        Err(BrokerError::ConnectionClosed(self.id))
    }

    fn confirm_consumer(&self, consumer: Consumer) -> Result<Consumer, BrokerError> {
        if self.is_open() {
            return Ok(consumer);
        }
        if let Err(e) = self.shared.messages.cancel(self.id, consumer.tag()) {
            warn!(connection_id = self.id, consumer_tag = %consumer.tag(), error = %e, "failed to cancel consumer of closed connection");
        }
        Err(BrokerError::ConnectionClosed(self.id))
    }

    fn confirm_get(
        &self,
        delivery: Option<Delivery>,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        // Auto-acked deliveries are already settled and have nothing to undo.
        if auto_ack || self.is_open() {
            return Ok(delivery);
        }
        if let Some(delivery) = delivery {
            self.shared.messages.nack(self.id, delivery.delivery_tag, true)?;
        }
        Err(BrokerError::ConnectionClosed(self.id))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(connection_id = self.id, error = %e, "failed to close connection on drop");
        }
    }
}
