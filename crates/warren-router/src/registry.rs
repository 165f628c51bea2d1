use crate::exchange::{Exchange, ExchangeInfo};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use warren_core::Queue;
use warren_internals::{ConnectionId, ExchangeKind, Message, QueueName, QueueOptions, WarrenError};

/// Name of the nameless direct exchange every queue is implicitly bound to.
pub const DEFAULT_EXCHANGE: &str = "";

/// Registry of every exchange and queue in a broker.
///
/// Map guards are only held long enough to clone an `Arc` out, never while a
/// queue lock is taken.
#[derive(Default)]
pub struct Router {
    exchanges: DashMap<String, Arc<Exchange>>,
    queues: DashMap<QueueName, Arc<Queue>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange. Redeclaring with identical parameters returns the
    /// existing exchange; the flag tells whether it was created.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(Arc<Exchange>, bool), WarrenError> {
        if name == DEFAULT_EXCHANGE {
            return Err(WarrenError::AccessRefused(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }

        match self.exchanges.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let exchange = existing.get();
                if exchange.kind() != kind || exchange.is_durable() != durable {
                    return Err(WarrenError::ExchangeConflict {
                        exchange_name: name.to_string(),
                        reason: format!(
                            "declared as {} (durable: {}), requested {} (durable: {})",
                            exchange.kind(),
                            exchange.is_durable(),
                            kind,
                            durable
                        ),
                    });
                }
                Ok((Arc::clone(exchange), false))
            }
            Entry::Vacant(slot) => {
                let exchange = Arc::new(Exchange::new(name.to_string(), kind, durable));
                slot.insert(Arc::clone(&exchange));
                Ok((exchange, true))
            }
        }
    }

    pub fn get_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name).map(|r| Arc::clone(&r))
    }

    pub fn remove_exchange(&self, name: &str) -> Result<Arc<Exchange>, WarrenError> {
        if name == DEFAULT_EXCHANGE {
            return Err(WarrenError::AccessRefused(
                "the default exchange cannot be deleted".to_string(),
            ));
        }
        self.exchanges
            .remove(name)
            .map(|(_, exchange)| exchange)
            .ok_or_else(|| WarrenError::ExchangeNotFound(name.to_string()))
    }

    /// Declare a queue, building it with `build` only if the name is free.
    ///
    /// An existing queue is returned when its flags match and the caller may
    /// use it; otherwise the declaration fails and nothing changes.
    pub fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        connection_id: ConnectionId,
        build: impl FnOnce() -> Queue,
    ) -> Result<(Arc<Queue>, bool), WarrenError> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let queue = existing.get();
                if !queue.is_accessible_by(connection_id) {
                    return Err(WarrenError::ResourceLocked(name.to_string()));
                }
                if queue.options() != options {
                    return Err(WarrenError::QueueConflict {
                        queue_name: name.to_string(),
                        reason: format!(
                            "declared with {:?}, requested {:?}",
                            queue.options(),
                            options
                        ),
                    });
                }
                Ok((Arc::clone(queue), false))
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(build());
                slot.insert(Arc::clone(&queue));
                Ok((queue, true))
            }
        }
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|r| Arc::clone(&r))
    }

    /// Unregisters a queue and removes every binding that references it.
    pub fn remove_queue(&self, name: &str) -> Result<Arc<Queue>, WarrenError> {
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| WarrenError::QueueNotFound(name.to_string()))?;

        for exchange in self.exchanges() {
            let removed = exchange.remove_queue(name)?;
            if !removed.is_empty() {
                debug!(
                    exchange = %exchange.name,
                    queue_name = %name,
                    bindings = removed.len(),
                    "removed bindings of deleted queue"
                );
            }
        }
        Ok(queue)
    }

    /// Returns `true` if the binding is new.
    pub fn bind(
        &self,
        exchange_name: &str,
        queue_name: &str,
        pattern: &str,
    ) -> Result<bool, WarrenError> {
        if exchange_name == DEFAULT_EXCHANGE {
            return Err(WarrenError::AccessRefused(
                "queues cannot be bound to the default exchange".to_string(),
            ));
        }
        let exchange = self
            .get_exchange(exchange_name)
            .ok_or_else(|| WarrenError::ExchangeNotFound(exchange_name.to_string()))?;
        if self.get_queue(queue_name).is_none() {
            return Err(WarrenError::QueueNotFound(queue_name.to_string()));
        }

        let created = exchange.bind(queue_name, pattern)?;

        // The queue may have been deleted between the lookup and the insert.
        let queue_gone = self.get_queue(queue_name).map_or(true, |q| q.is_deleted());
        if queue_gone {
            exchange.unbind(queue_name, pattern)?;
            return Err(WarrenError::QueueNotFound(queue_name.to_string()));
        }
        Ok(created)
    }

    /// Returns `true` if the binding existed.
    pub fn unbind(
        &self,
        exchange_name: &str,
        queue_name: &str,
        pattern: &str,
    ) -> Result<bool, WarrenError> {
        if exchange_name == DEFAULT_EXCHANGE {
            return Err(WarrenError::AccessRefused(
                "queues cannot be unbound from the default exchange".to_string(),
            ));
        }
        let exchange = self
            .get_exchange(exchange_name)
            .ok_or_else(|| WarrenError::ExchangeNotFound(exchange_name.to_string()))?;
        exchange.unbind(queue_name, pattern)
    }

    /// Routes `msg` through `exchange_name` and enqueues one copy into each
    /// selected queue. Returns how many queues accepted it.
    pub fn route(&self, exchange_name: &str, msg: Message) -> Result<usize, WarrenError> {
        let targets: BTreeSet<QueueName> = if exchange_name == DEFAULT_EXCHANGE {
            std::iter::once(msg.routing_key.clone()).collect()
        } else {
            let exchange = self
                .get_exchange(exchange_name)
                .ok_or_else(|| WarrenError::ExchangeNotFound(exchange_name.to_string()))?;
            exchange.route(&msg.routing_key)?
        };

        let mut routed = 0;
        for queue_name in targets {
            let Some(queue) = self.get_queue(&queue_name) else {
                continue;
            };
            match queue.enqueue(msg.clone()) {
                Ok(()) => routed += 1,
                Err(WarrenError::QueueFull(_)) => {
                    warn!(queue_name = %queue_name, exchange = %exchange_name, "queue full, dropping message copy");
                }
                Err(WarrenError::QueueNotFound(_)) => {
                    debug!(queue_name = %queue_name, "queue deleted while routing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(routed)
    }

    pub fn exchanges(&self) -> Vec<Arc<Exchange>> {
        self.exchanges.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> =
            self.queues.iter().map(|r| Arc::clone(r.value())).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    pub fn list_exchanges(&self) -> Vec<ExchangeInfo> {
        let mut infos: Vec<ExchangeInfo> = self.exchanges().iter().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// `(queue, pattern)` pairs of an exchange. For the default exchange
    /// these are the implicit by-name bindings of every queue.
    pub fn bindings_for(
        &self,
        exchange_name: &str,
    ) -> Result<Vec<(QueueName, String)>, WarrenError> {
        if exchange_name == DEFAULT_EXCHANGE {
            return Ok(self
                .queues()
                .iter()
                .map(|q| (q.name.clone(), q.name.clone()))
                .collect());
        }
        self.get_exchange(exchange_name)
            .ok_or_else(|| WarrenError::ExchangeNotFound(exchange_name.to_string()))?
            .bindings()
    }

    /// Exclusive queues declared by `connection_id`.
    pub fn queues_owned_by(&self, connection_id: ConnectionId) -> Vec<Arc<Queue>> {
        self.queues()
            .into_iter()
            .filter(|q| q.owner() == Some(connection_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_acks::AckManager;
    use warren_core::{MemoryStore, QueueContext};
    use warren_internals::MessageProperties;

    fn context(max_capacity: usize) -> QueueContext {
        QueueContext {
            acks: Arc::new(AckManager::new()),
            store: Arc::new(MemoryStore::new()),
            max_capacity,
        }
    }

    fn add_queue(router: &Router, name: &str, max_capacity: usize) -> Arc<Queue> {
        let (queue, created) = router
            .declare_queue(name, QueueOptions::default(), 1, || {
                Queue::new(name.to_string(), QueueOptions::default(), None, context(max_capacity))
            })
            .unwrap();
        assert!(created);
        queue
    }

    fn msg(exchange: &str, key: &str) -> Message {
        Message::new(exchange, key, b"payload".to_vec(), MessageProperties::default())
    }

    #[test]
    fn test_router_exchange_lifecycle() {
        let router = Router::new();

        let (ex, created) = router.declare_exchange("orders", ExchangeKind::Direct, true).unwrap();
        assert!(created);
        assert_eq!(ex.name, "orders");

        // Redeclaring with the same parameters is a no-op
        let (_, created) = router.declare_exchange("orders", ExchangeKind::Direct, true).unwrap();
        assert!(!created);

        // Different parameters conflict and leave the original untouched
        assert!(matches!(
            router.declare_exchange("orders", ExchangeKind::Topic, true),
            Err(WarrenError::ExchangeConflict { .. })
        ));
        assert_eq!(router.get_exchange("orders").unwrap().kind(), ExchangeKind::Direct);

        router.remove_exchange("orders").unwrap();
        assert!(matches!(
            router.remove_exchange("orders"),
            Err(WarrenError::ExchangeNotFound(_))
        ));
    }

    #[test]
    fn test_default_exchange_is_reserved() {
        let router = Router::new();
        add_queue(&router, "hello", 10);
        assert!(matches!(
            router.declare_exchange("", ExchangeKind::Direct, false),
            Err(WarrenError::AccessRefused(_))
        ));
        assert!(matches!(router.bind("", "hello", "x"), Err(WarrenError::AccessRefused(_))));
        assert!(matches!(router.remove_exchange(""), Err(WarrenError::AccessRefused(_))));
        assert_eq!(
            router.bindings_for("").unwrap(),
            vec![("hello".to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn test_default_exchange_routes_by_queue_name() {
        let router = Router::new();
        let hello = add_queue(&router, "hello", 10);

        assert_eq!(router.route("", msg("", "hello")).unwrap(), 1);
        assert_eq!(router.route("", msg("", "nobody")).unwrap(), 0);
        assert_eq!(hello.len(), 1);
    }

    #[test]
    fn test_route_to_missing_exchange_fails() {
        let router = Router::new();
        assert!(matches!(
            router.route("missing", msg("missing", "key")),
            Err(WarrenError::ExchangeNotFound(_))
        ));
    }

    #[test]
    fn test_fanout_copies_into_every_bound_queue() {
        let router = Router::new();
        router.declare_exchange("logs", ExchangeKind::Fanout, false).unwrap();
        let queues: Vec<_> = (0..3)
            .map(|i| add_queue(&router, &format!("q{}", i), 10))
            .collect();
        for q in &queues {
            router.bind("logs", &q.name, "").unwrap();
        }

        assert_eq!(router.route("logs", msg("logs", "whatever")).unwrap(), 3);
        assert!(queues.iter().all(|q| q.len() == 1));
    }

    #[test]
    fn test_unmatched_publish_is_dropped() {
        let router = Router::new();
        router.declare_exchange("direct_logs", ExchangeKind::Direct, false).unwrap();
        let warnings = add_queue(&router, "warnings", 10);
        router.bind("direct_logs", "warnings", "warning").unwrap();

        assert_eq!(router.route("direct_logs", msg("direct_logs", "error")).unwrap(), 0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bind_requires_both_endpoints() {
        let router = Router::new();
        router.declare_exchange("logs", ExchangeKind::Fanout, false).unwrap();
        add_queue(&router, "q", 10);

        assert!(matches!(router.bind("nope", "q", ""), Err(WarrenError::ExchangeNotFound(_))));
        assert!(matches!(router.bind("logs", "nope", ""), Err(WarrenError::QueueNotFound(_))));
        assert!(router.bind("logs", "q", "").unwrap());
        assert!(!router.bind("logs", "q", "").unwrap());
    }

    #[test]
    fn test_queue_deletion_cascades_bindings() {
        let router = Router::new();
        router.declare_exchange("topic_logs", ExchangeKind::Topic, false).unwrap();
        router.declare_exchange("logs", ExchangeKind::Fanout, false).unwrap();
        add_queue(&router, "q", 10);
        router.bind("topic_logs", "q", "kern.*").unwrap();
        router.bind("topic_logs", "q", "#.critical").unwrap();
        router.bind("logs", "q", "").unwrap();

        router.remove_queue("q").unwrap();
        assert!(router.bindings_for("topic_logs").unwrap().is_empty());
        assert!(router.bindings_for("logs").unwrap().is_empty());
    }

    #[test]
    fn test_full_queue_does_not_block_other_targets() {
        let router = Router::new();
        router.declare_exchange("logs", ExchangeKind::Fanout, false).unwrap();
        let small = add_queue(&router, "small", 1);
        let big = add_queue(&router, "big", 10);
        router.bind("logs", "small", "").unwrap();
        router.bind("logs", "big", "").unwrap();

        assert_eq!(router.route("logs", msg("logs", "")).unwrap(), 2);
        assert_eq!(router.route("logs", msg("logs", "")).unwrap(), 1);
        assert_eq!(small.len(), 1);
        assert_eq!(big.len(), 2);
    }

    #[test]
    fn test_queue_declaration_rules() {
        let router = Router::new();
        let build = |owner| {
            move || Queue::new("private".into(), QueueOptions::exclusive(), owner, context(10))
        };

        router
            .declare_queue("private", QueueOptions::exclusive(), 7, build(Some(7)))
            .unwrap();
        let (_, created) = router
            .declare_queue("private", QueueOptions::exclusive(), 7, build(Some(7)))
            .unwrap();
        assert!(!created);

        assert!(matches!(
            router.declare_queue("private", QueueOptions::exclusive(), 8, build(Some(8))),
            Err(WarrenError::ResourceLocked(_))
        ));
        assert!(matches!(
            router.declare_queue("private", QueueOptions::durable(), 7, build(Some(7))),
            Err(WarrenError::QueueConflict { .. })
        ));
        assert_eq!(router.queues_owned_by(7).len(), 1);
        assert!(router.queues_owned_by(8).is_empty());
    }
}
