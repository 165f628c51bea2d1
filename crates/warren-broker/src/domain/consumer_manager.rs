use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use warren_internals::{ConnectionId, ConsumerTag, QueueName, WarrenError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub queue_name: QueueName,
    pub connection_id: ConnectionId,
    pub auto_ack: bool,
    pub prefetch: u16,
}

struct Registration {
    id: u64,
    info: ConsumerInfo,
}

/// Broker-wide index of attached consumers by tag.
#[derive(Default)]
pub struct ConsumerManager {
    consumers: DashMap<ConsumerTag, Registration>,
    next_registration: AtomicU64,
}

impl ConsumerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer. Tags are unique across the broker.
    /// Returns an id that identifies this registration of the tag.
    pub fn register_consumer(&self, tag: &str, info: ConsumerInfo) -> Result<u64, WarrenError> {
        match self.consumers.entry(tag.to_string()) {
            Entry::Occupied(_) => Err(WarrenError::ConsumerTagInUse(tag.to_string())),
            Entry::Vacant(slot) => {
                let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
                slot.insert(Registration { id, info });
                Ok(id)
            }
        }
    }

    pub fn get(&self, tag: &str) -> Option<ConsumerInfo> {
        self.consumers.get(tag).map(|c| c.info.clone())
    }

    /// Removes a consumer only if `connection_id` owns it.
    pub fn unregister(
        &self,
        tag: &str,
        connection_id: ConnectionId,
    ) -> Result<ConsumerInfo, WarrenError> {
        self.consumers
            .remove_if(tag, |_, c| c.info.connection_id == connection_id)
            .map(|(_, c)| c.info)
            .ok_or_else(|| WarrenError::ConsumerNotFound(tag.to_string()))
    }

    /// Removes the consumer only if the tag still belongs to `registration`.
    pub fn unregister_registration(&self, tag: &str, registration: u64) -> Option<ConsumerInfo> {
        self.consumers
            .remove_if(tag, |_, c| c.id == registration)
            .map(|(_, c)| c.info)
    }

    /// Tags of every consumer opened on `connection_id`.
    pub fn for_connection(&self, connection_id: ConnectionId) -> Vec<ConsumerTag> {
        let mut tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .filter(|c| c.info.connection_id == connection_id)
            .map(|c| c.key().clone())
            .collect();
        tags.sort();
        tags
    }

    /// Forgets every consumer of a deleted queue.
    pub fn remove_queue(&self, queue_name: &str) -> usize {
        let before = self.consumers.len();
        self.consumers.retain(|_, c| c.info.queue_name != queue_name);
        before.saturating_sub(self.consumers.len())
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(queue: &str, connection_id: ConnectionId) -> ConsumerInfo {
        ConsumerInfo {
            queue_name: queue.to_string(),
            connection_id,
            auto_ack: false,
            prefetch: 1,
        }
    }

    #[test]
    fn test_register_consumer() {
        let manager = ConsumerManager::new();
        manager.register_consumer("ctag-1", info("task_queue", 1)).unwrap();
        assert_eq!(manager.get("ctag-1"), Some(info("task_queue", 1)));

        assert!(matches!(
            manager.register_consumer("ctag-1", info("other", 2)),
            Err(WarrenError::ConsumerTagInUse(_))
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_unregister_checks_owner() {
        let manager = ConsumerManager::new();
        manager.register_consumer("ctag-1", info("task_queue", 1)).unwrap();

        assert!(matches!(
            manager.unregister("ctag-1", 2),
            Err(WarrenError::ConsumerNotFound(_))
        ));
        assert!(manager.unregister("ctag-1", 1).is_ok());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_connection_and_queue_lookups() {
        let manager = ConsumerManager::new();
        manager.register_consumer("b", info("q1", 1)).unwrap();
        manager.register_consumer("a", info("q2", 1)).unwrap();
        manager.register_consumer("c", info("q1", 2)).unwrap();

        assert_eq!(manager.for_connection(1), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.remove_queue("q1"), 2);
        assert_eq!(manager.for_connection(2), Vec::<String>::new());
    }

    #[test]
    fn test_stale_registration_cannot_remove_reused_tag() {
        let manager = ConsumerManager::new();
        let first = manager.register_consumer("worker", info("task_queue", 1)).unwrap();
        manager.unregister("worker", 1).unwrap();
        let second = manager.register_consumer("worker", info("task_queue", 1)).unwrap();
        assert_ne!(first, second);

        assert!(manager.unregister_registration("worker", first).is_none());
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.unregister_registration("worker", second),
            Some(info("task_queue", 1))
        );
        assert!(manager.is_empty());
    }
}
