use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use warren_acks::{AckManager, AckRecord};
use warren_core::Consumer;
use warren_internals::{
    ConnectionId, Delivery, DeliveryTag, Message, MessageProperties, WarrenError,
};
use warren_router::Router;

use super::consumer_manager::{ConsumerInfo, ConsumerManager};
use super::topology_manager::TopologyManager;
use crate::connection::ConsumeOptions;
use crate::error::BrokerError;

/// Publish, consume and acknowledgement paths.
pub struct MessageHandler {
    router: Arc<Router>,
    topology: Arc<TopologyManager>,
    consumers: Arc<ConsumerManager>,
    acks: Arc<AckManager>,
    default_prefetch: u16,
}

impl MessageHandler {
    pub fn new(
        router: Arc<Router>,
        topology: Arc<TopologyManager>,
        consumers: Arc<ConsumerManager>,
        acks: Arc<AckManager>,
        default_prefetch: u16,
    ) -> Self {
        Self {
            router,
            topology,
            consumers,
            acks,
            default_prefetch,
        }
    }

    /// Returns the number of queues the message was enqueued into.
    #[instrument(skip_all, fields(exchange_name=%exchange_name, routing_key=%routing_key))]
    pub fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<usize, BrokerError> {
        let msg = Message::new(exchange_name, routing_key, payload, properties);
        let routed = self.router.route(exchange_name, msg)?;
        if routed == 0 {
            debug!("message matched no queue and was dropped");
        }
        Ok(routed)
    }

    #[instrument(skip_all, fields(queue_name=%queue_name, connection_id=connection_id))]
    pub fn consume(
        &self,
        queue_name: &str,
        connection_id: ConnectionId,
        options: ConsumeOptions,
    ) -> Result<Consumer, BrokerError> {
        let queue = self.topology.accessible_queue(queue_name, connection_id)?;

        let tag = match options.consumer_tag {
            Some(tag) if tag.is_empty() => {
                return Err(BrokerError::InvalidConsumerConfig {
                    reason: "consumer tag must not be empty".to_string(),
                })
            }
            Some(tag) => tag,
            None => format!("ctag-{}", Uuid::new_v4()),
        };
        let prefetch = options.prefetch.unwrap_or(self.default_prefetch);

        let registration = self.consumers.register_consumer(
            &tag,
            ConsumerInfo {
                queue_name: queue_name.to_string(),
                connection_id,
                auto_ack: options.auto_ack,
                prefetch,
            },
        )?;

        match queue.attach(tag.clone(), connection_id, options.auto_ack, prefetch) {
            Ok(consumer) => {
                info!(
                    consumer_tag = %tag,
                    auto_ack = options.auto_ack,
                    prefetch,
                    "consumer attached"
                );
                // Dropping the handle without a cancel releases the tag and
                // returns its unacked deliveries to the queue.
                let consumers = Arc::clone(&self.consumers);
                let hook_tag = tag.clone();
                Ok(consumer.on_drop(move || {
                    if consumers
                        .unregister_registration(&hook_tag, registration)
                        .is_none()
                    {
                        return;
                    }
                    match queue.detach(&hook_tag) {
                        Ok(requeued) => debug!(consumer_tag = %hook_tag, requeued, "dropped consumer detached"),
                        Err(e) => warn!(consumer_tag = %hook_tag, error = %e, "failed to detach dropped consumer"),
                    }
                }))
            }
            Err(e) => {
                let _ = self.consumers.unregister(&tag, connection_id);
                Err(e.into())
            }
        }
    }

    /// Synchronous pull of one message.
    #[instrument(skip_all, fields(queue_name=%queue_name, connection_id=connection_id))]
    pub fn get(
        &self,
        queue_name: &str,
        connection_id: ConnectionId,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        let queue = self.topology.accessible_queue(queue_name, connection_id)?;
        Ok(queue.fetch(connection_id, auto_ack)?)
    }

    fn settle(&self, record: &AckRecord) -> Result<(), WarrenError> {
        match self.router.get_queue(&record.queue_name) {
            Some(queue) => queue.settle(record),
            // Queue deleted after delivery: nothing left to settle.
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(connection_id=connection_id, delivery_tag=tag))]
    pub fn ack(&self, connection_id: ConnectionId, tag: DeliveryTag) -> Result<(), BrokerError> {
        let record = self.acks.take(connection_id, tag).map_err(WarrenError::from)?;
        self.settle(&record)?;
        debug!("delivery acknowledged");
        Ok(())
    }

    /// Acknowledges every outstanding delivery of the connection up to `tag`.
    #[instrument(skip_all, fields(connection_id=connection_id, delivery_tag=tag))]
    pub fn ack_multiple(
        &self,
        connection_id: ConnectionId,
        tag: DeliveryTag,
    ) -> Result<usize, BrokerError> {
        let records = self
            .acks
            .take_up_to(connection_id, tag)
            .map_err(WarrenError::from)?;
        for record in &records {
            self.settle(record)?;
        }
        debug!(acked = records.len(), "deliveries acknowledged");
        Ok(records.len())
    }

    #[instrument(skip_all, fields(connection_id=connection_id, delivery_tag=tag, requeue=requeue))]
    pub fn nack(
        &self,
        connection_id: ConnectionId,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let record = self.acks.take(connection_id, tag).map_err(WarrenError::from)?;
        if let Some(queue) = self.router.get_queue(&record.queue_name) {
            queue.reject(record, requeue)?;
        }
        Ok(())
    }

    /// Detaches a consumer. Its unacknowledged deliveries go back to the head
    /// of the queue; the count of requeued messages is returned.
    #[instrument(skip_all, fields(connection_id=connection_id, consumer_tag=%consumer_tag))]
    pub fn cancel(
        &self,
        connection_id: ConnectionId,
        consumer_tag: &str,
    ) -> Result<usize, BrokerError> {
        let info = self.consumers.unregister(consumer_tag, connection_id)?;
        let requeued = match self.router.get_queue(&info.queue_name) {
            Some(queue) => queue.detach(consumer_tag)?,
            None => 0,
        };
        info!(requeued, "consumer cancelled");
        Ok(requeued)
    }

    /// Cancels a connection's consumers and returns every delivery it still
    /// holds, including unacknowledged gets, to its queue.
    #[instrument(skip_all, fields(connection_id=connection_id))]
    pub fn release_connection(&self, connection_id: ConnectionId) -> Result<usize, BrokerError> {
        let mut requeued = 0;
        for tag in self.consumers.for_connection(connection_id) {
            match self.cancel(connection_id, &tag) {
                Ok(n) => requeued += n,
                Err(e) => warn!(consumer_tag = %tag, error = %e, "failed to cancel consumer"),
            }
        }

        let mut by_queue: BTreeMap<String, Vec<AckRecord>> = BTreeMap::new();
        for record in self.acks.drain_connection(connection_id) {
            by_queue
                .entry(record.queue_name.clone())
                .or_default()
                .push(record);
        }
        for (queue_name, records) in by_queue {
            if let Some(queue) = self.router.get_queue(&queue_name) {
                requeued += queue.requeue(records)?;
            }
        }
        Ok(requeued)
    }
}
