use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use warren_acks::AckManager;
use warren_core::{MemoryStore, MessageStore, QueueStats, SledStore};
use warren_internals::{ConnectionId, QueueName, WarrenError};
use warren_router::{ExchangeInfo, Router};

use crate::config::{BrokerConfig, StoreKind};
use crate::connection::Connection;
use crate::domain::consumer_manager::ConsumerManager;
use crate::domain::message_handler::MessageHandler;
use crate::domain::topology_manager::TopologyManager;
use crate::error::BrokerError;

/// State shared by the broker handle and every connection.
pub(crate) struct Shared {
    pub(crate) router: Arc<Router>,
    pub(crate) topology: Arc<TopologyManager>,
    pub(crate) messages: MessageHandler,
    store: Arc<dyn MessageStore>,
    open_connections: DashSet<ConnectionId>,
    next_connection_id: AtomicU64,
}

impl Shared {
    pub(crate) fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.open_connections.contains(&connection_id)
    }

    /// Tears down a connection: consumers are cancelled, held deliveries go
    /// back to their queues, exclusive queues are deleted. Idempotent.
    #[instrument(skip_all, fields(connection_id=connection_id))]
    pub(crate) fn close_connection(&self, connection_id: ConnectionId) -> Result<(), BrokerError> {
        if self.open_connections.remove(&connection_id).is_none() {
            return Ok(());
        }
        let requeued = self.messages.release_connection(connection_id)?;
        let deleted = self.topology.delete_owned_queues(connection_id)?;
        info!(requeued, exclusive_queues_deleted = deleted, "connection closed");
        Ok(())
    }
}

/// Explicitly owned broker registry: exchanges, queues, bindings and the
/// durable store behind them.
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Opens the broker with the store named in `config`.
    pub fn open(config: BrokerConfig) -> Result<Self, BrokerError> {
        let store: Arc<dyn MessageStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Sled => {
                Arc::new(SledStore::open(&config.store.path).map_err(WarrenError::from)?)
            }
        };
        Self::with_store(config, store)
    }

    /// Opens the broker on `store`, restoring whatever durable state it holds.
    pub fn with_store(
        config: BrokerConfig,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, BrokerError> {
        let router = Arc::new(Router::new());
        let consumers = Arc::new(ConsumerManager::new());
        let acks = Arc::new(AckManager::new());
        let topology = Arc::new(TopologyManager::new(
            Arc::clone(&router),
            Arc::clone(&consumers),
            Arc::clone(&store),
            Arc::clone(&acks),
            config.max_queue_length,
        ));
        let messages = MessageHandler::new(
            Arc::clone(&router),
            Arc::clone(&topology),
            consumers,
            acks,
            config.default_prefetch,
        );

        let snapshot = store.load().map_err(WarrenError::from)?;
        topology.restore(snapshot)?;

        Ok(Self {
            shared: Arc::new(Shared {
                router,
                topology,
                messages,
                store,
                open_connections: DashSet::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn connect(&self) -> Connection {
        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.shared.open_connections.insert(id);
        info!(connection_id = id, "connection opened");
        Connection::new(id, Arc::clone(&self.shared))
    }

    pub fn list_exchanges(&self) -> Vec<ExchangeInfo> {
        self.shared.router.list_exchanges()
    }

    pub fn list_queues(&self) -> Vec<QueueStats> {
        self.shared
            .router
            .queues()
            .iter()
            .filter_map(|q| q.stats().ok())
            .collect()
    }

    pub fn bindings_for(&self, exchange: &str) -> Result<Vec<(QueueName, String)>, BrokerError> {
        Ok(self.shared.router.bindings_for(exchange)?)
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let queue = self
            .shared
            .router
            .get_queue(queue)
            .ok_or_else(|| WarrenError::QueueNotFound(queue.to_string()))?;
        Ok(queue.stats()?)
    }

    /// Closes every open connection, then flushes the store.
    #[instrument(skip_all)]
    pub fn shutdown(&self) -> Result<(), BrokerError> {
        let open: Vec<ConnectionId> = self.shared.open_connections.iter().map(|id| *id).collect();
        for connection_id in open {
            if let Err(e) = self.shared.close_connection(connection_id) {
                warn!(connection_id, error = %e, "failed to close connection");
            }
        }
        self.shared.store.flush().map_err(WarrenError::from)?;
        info!("broker shut down");
        Ok(())
    }
}
