use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use warren_acks::AckManager;
use warren_core::{
    BindingRecord, ExchangeRecord, MessageStore, Queue, QueueContext, QueueRecord, StoreSnapshot,
};
use warren_internals::{ConnectionId, ExchangeKind, QueueOptions, WarrenError};
use warren_router::Router;

use super::consumer_manager::ConsumerManager;
use crate::error::BrokerError;

/// Manages exchange, queue and binding lifecycle, mirroring durable
/// entities into the message store.
pub struct TopologyManager {
    router: Arc<Router>,
    consumers: Arc<ConsumerManager>,
    store: Arc<dyn MessageStore>,
    acks: Arc<AckManager>,
    max_queue_length: usize,
}

fn is_persisted(queue: &Queue) -> bool {
    queue.is_durable() && !queue.is_exclusive()
}

impl TopologyManager {
    pub fn new(
        router: Arc<Router>,
        consumers: Arc<ConsumerManager>,
        store: Arc<dyn MessageStore>,
        acks: Arc<AckManager>,
        max_queue_length: usize,
    ) -> Self {
        Self {
            router,
            consumers,
            store,
            acks,
            max_queue_length,
        }
    }

    fn queue_context(&self) -> QueueContext {
        QueueContext {
            acks: Arc::clone(&self.acks),
            store: Arc::clone(&self.store),
            max_capacity: self.max_queue_length,
        }
    }

    #[instrument(skip_all, fields(exchange_name=%name, exchange_kind=%kind))]
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let (_, created) = self.router.declare_exchange(name, kind, durable)?;
        if !created {
            return Ok(());
        }

        if durable {
            let record = ExchangeRecord {
                name: name.to_string(),
                kind,
            };
            if let Err(e) = self.store.save_exchange(&record) {
                // Roll back so the failed declaration leaves nothing behind.
                let _ = self.router.remove_exchange(name);
                return Err(WarrenError::from(e).into());
            }
        }
        info!("exchange declared");
        Ok(())
    }

    #[instrument(skip_all, fields(exchange_name=%name))]
    pub fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let exchange = self.router.remove_exchange(name)?;
        if exchange.is_durable() {
            self.store.delete_exchange(name).map_err(WarrenError::from)?;
        }
        info!("exchange deleted");
        Ok(())
    }

    /// Declares a queue and returns its name; `""` asks for a generated one.
    #[instrument(skip_all, fields(queue_name=%name, connection_id=connection_id))]
    pub fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        connection_id: ConnectionId,
    ) -> Result<String, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let owner = options.exclusive.then_some(connection_id);

        let (queue, created) = self.router.declare_queue(&name, options, connection_id, || {
            Queue::new(name.clone(), options, owner, self.queue_context())
        })?;
        if !created {
            return Ok(name);
        }

        if is_persisted(&queue) {
            let record = QueueRecord {
                name: name.clone(),
                options,
            };
            if let Err(e) = self.store.save_queue(&record) {
                let _ = self.router.remove_queue(&name);
                return Err(WarrenError::from(e).into());
            }
        }
        info!(queue_name = %name, "queue declared");
        Ok(name)
    }

    /// Looks up a queue `connection_id` is allowed to use.
    pub fn accessible_queue(
        &self,
        name: &str,
        connection_id: ConnectionId,
    ) -> Result<Arc<Queue>, WarrenError> {
        let queue = self
            .router
            .get_queue(name)
            .ok_or_else(|| WarrenError::QueueNotFound(name.to_string()))?;
        if !queue.is_accessible_by(connection_id) {
            return Err(WarrenError::ResourceLocked(name.to_string()));
        }
        Ok(queue)
    }

    /// Deletes a queue with its bindings and stored messages. Returns the
    /// number of ready messages discarded.
    #[instrument(skip_all, fields(queue_name=%name))]
    pub fn delete_queue(
        &self,
        name: &str,
        connection_id: ConnectionId,
    ) -> Result<usize, BrokerError> {
        self.accessible_queue(name, connection_id)?;
        let queue = self.router.remove_queue(name)?;
        let discarded = queue.close()?;
        self.consumers.remove_queue(name);

        if is_persisted(&queue) {
            self.store.delete_queue(name).map_err(WarrenError::from)?;
        }
        info!(discarded, "queue deleted");
        Ok(discarded)
    }

    #[instrument(skip_all, fields(queue_name=%name))]
    pub fn purge_queue(
        &self,
        name: &str,
        connection_id: ConnectionId,
    ) -> Result<usize, BrokerError> {
        let purged = self.accessible_queue(name, connection_id)?.purge()?;
        info!(purged, "queue purged");
        Ok(purged)
    }

    fn binding_persisted(&self, exchange_name: &str, queue: &Queue) -> bool {
        is_persisted(queue)
            && self
                .router
                .get_exchange(exchange_name)
                .is_some_and(|e| e.is_durable())
    }

    #[instrument(skip_all, fields(exchange_name=%exchange_name, queue_name=%queue_name))]
    pub fn bind_queue(
        &self,
        queue_name: &str,
        exchange_name: &str,
        pattern: &str,
        connection_id: ConnectionId,
    ) -> Result<(), BrokerError> {
        let queue = self.accessible_queue(queue_name, connection_id)?;
        let created = self.router.bind(exchange_name, queue_name, pattern)?;

        if created && self.binding_persisted(exchange_name, &queue) {
            let record = BindingRecord {
                exchange: exchange_name.to_string(),
                queue: queue_name.to_string(),
                pattern: pattern.to_string(),
            };
            if let Err(e) = self.store.save_binding(&record) {
                let _ = self.router.unbind(exchange_name, queue_name, pattern);
                return Err(WarrenError::from(e).into());
            }
        }
        info!(pattern, "queue bound");
        Ok(())
    }

    #[instrument(skip_all, fields(exchange_name=%exchange_name, queue_name=%queue_name))]
    pub fn unbind_queue(
        &self,
        queue_name: &str,
        exchange_name: &str,
        pattern: &str,
        connection_id: ConnectionId,
    ) -> Result<(), BrokerError> {
        let queue = self.accessible_queue(queue_name, connection_id)?;
        let removed = self.router.unbind(exchange_name, queue_name, pattern)?;

        if removed && self.binding_persisted(exchange_name, &queue) {
            let record = BindingRecord {
                exchange: exchange_name.to_string(),
                queue: queue_name.to_string(),
                pattern: pattern.to_string(),
            };
            self.store.delete_binding(&record).map_err(WarrenError::from)?;
        }
        Ok(())
    }

    /// Deletes the exclusive queues owned by a closing connection.
    pub fn delete_owned_queues(&self, connection_id: ConnectionId) -> Result<usize, BrokerError> {
        let owned = self.router.queues_owned_by(connection_id);
        for queue in &owned {
            self.delete_queue(&queue.name, connection_id)?;
        }
        Ok(owned.len())
    }

    /// Rebuilds durable topology and messages from a store snapshot.
    #[instrument(skip_all)]
    pub fn restore(&self, snapshot: StoreSnapshot) -> Result<(), BrokerError> {
        let StoreSnapshot {
            exchanges,
            queues,
            bindings,
            mut messages,
        } = snapshot;

        for record in exchanges {
            self.router.declare_exchange(&record.name, record.kind, true)?;
        }

        let mut restored = 0;
        for record in queues {
            let (queue, _) = self.router.declare_queue(&record.name, record.options, 0, || {
                Queue::new(record.name.clone(), record.options, None, self.queue_context())
            })?;
            if let Some(entries) = messages.remove(&record.name) {
                restored += queue.restore(entries)?;
            }
        }

        for record in bindings {
            if let Err(e) = self.router.bind(&record.exchange, &record.queue, &record.pattern) {
                warn!(
                    error = %e,
                    exchange = %record.exchange,
                    queue_name = %record.queue,
                    "skipping stored binding"
                );
            }
        }

        for queue_name in messages.keys() {
            warn!(queue_name = %queue_name, "stored messages belong to an unknown queue");
        }
        info!(
            exchanges = self.router.list_exchanges().len(),
            queues = self.router.queues().len(),
            messages = restored,
            "topology restored"
        );
        Ok(())
    }
}
