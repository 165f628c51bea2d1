use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use warren_internals::{
    ConnectionId, ConsumerTag, DeliveryTag, Message, QueueName, WarrenError,
};

/// An explicit-ack delivery that has been handed out but not yet settled.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub delivery_tag: DeliveryTag,
    pub consumer_tag: Option<ConsumerTag>,
    pub connection_id: ConnectionId,
    pub queue_name: QueueName,
    /// Identity of the queue instance; a queue redeclared under the same
    /// name gets a new one.
    pub queue_id: u64,
    /// Position of the message in its queue's arrival order.
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug, Eq, PartialEq)]
pub enum AckStatus {
    AckRecordNotFound(DeliveryTag),
}

impl From<AckStatus> for WarrenError {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::AckRecordNotFound(tag) => WarrenError::UnknownDeliveryTag(tag),
        }
    }
}

impl AckRecord {
    pub fn new(
        delivery_tag: DeliveryTag,
        consumer_tag: Option<ConsumerTag>,
        connection_id: ConnectionId,
        queue_name: QueueName,
        queue_id: u64,
        seq: u64,
        message: Message,
    ) -> Self {
        AckRecord {
            delivery_tag,
            consumer_tag,
            connection_id,
            queue_name,
            queue_id,
            seq,
            message,
        }
    }
}

/// Allocates delivery tags and tracks unacknowledged deliveries broker-wide.
pub struct AckManager {
    records: DashMap<DeliveryTag, AckRecord>,
    next_tag: AtomicU64,
}

impl Default for AckManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AckManager {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn next_delivery_tag(&self) -> DeliveryTag {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_record(&self, record: AckRecord) {
        debug!(delivery_tag = record.delivery_tag, queue_name = %record.queue_name, "tracking delivery");
        self.records.insert(record.delivery_tag, record);
    }

    /// Removes the record for `tag` if it was delivered on `connection_id`.
    pub fn take(
        &self,
        connection_id: ConnectionId,
        tag: DeliveryTag,
    ) -> Result<AckRecord, AckStatus> {
        self.records
            .remove_if(&tag, |_, record| record.connection_id == connection_id)
            .map(|(_, record)| record)
            .ok_or(AckStatus::AckRecordNotFound(tag))
    }

    /// Removes every record of `connection_id` with a tag up to and including `tag`.
    /// `tag` itself must be outstanding on that connection.
    pub fn take_up_to(
        &self,
        connection_id: ConnectionId,
        tag: DeliveryTag,
    ) -> Result<Vec<AckRecord>, AckStatus> {
        let owned = self
            .records
            .get(&tag)
            .map(|record| record.connection_id == connection_id)
            .unwrap_or(false);
        if !owned {
            return Err(AckStatus::AckRecordNotFound(tag));
        }

        let mut tags: Vec<DeliveryTag> = self
            .records
            .iter()
            .filter(|entry| entry.connection_id == connection_id && *entry.key() <= tag)
            .map(|entry| *entry.key())
            .collect();
        tags.sort_unstable();

        Ok(tags
            .into_iter()
            .filter_map(|t| self.take(connection_id, t).ok())
            .collect())
    }

    /// Removes all records held by a consumer, oldest delivery first.
    pub fn drain_consumer(&self, consumer_tag: &str) -> Vec<AckRecord> {
        self.drain_where(|record| record.consumer_tag.as_deref() == Some(consumer_tag))
    }

    /// Removes all records delivered on a connection, oldest delivery first.
    pub fn drain_connection(&self, connection_id: ConnectionId) -> Vec<AckRecord> {
        self.drain_where(|record| record.connection_id == connection_id)
    }

    /// Removes all records of a queue instance, e.g. when it is deleted.
    pub fn drain_queue(&self, queue_id: u64) -> Vec<AckRecord> {
        self.drain_where(|record| record.queue_id == queue_id)
    }

    pub fn pending_for_queue(&self, queue_id: u64) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.queue_id == queue_id)
            .count()
    }

    pub fn pending_for_consumer(&self, consumer_tag: &str) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.consumer_tag.as_deref() == Some(consumer_tag))
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn drain_where(&self, predicate: impl Fn(&AckRecord) -> bool) -> Vec<AckRecord> {
        let tags: Vec<DeliveryTag> = self
            .records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut drained: Vec<AckRecord> = tags
            .into_iter()
            .filter_map(|tag| self.records.remove(&tag).map(|(_, record)| record))
            .collect();
        drained.sort_by_key(|record| record.delivery_tag);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn create_record(manager: &AckManager, consumer: &str, connection: ConnectionId) -> AckRecord {
        AckRecord::new(
            manager.next_delivery_tag(),
            Some(consumer.to_string()),
            connection,
            "task_queue".to_string(),
            1,
            0,
            Message {
                uuid: Uuid::new_v4(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_delivery_tags_are_increasing() {
        let manager = AckManager::new();
        let first = manager.next_delivery_tag();
        let second = manager.next_delivery_tag();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn test_ack_manager_flow() {
        let manager = AckManager::new();
        let record = create_record(&manager, "ctag-1", 1);
        let tag = record.delivery_tag;
        manager.add_record(record);

        // Wrong connection cannot settle it
        assert_eq!(manager.take(2, tag).unwrap_err(), AckStatus::AckRecordNotFound(tag));
        assert_eq!(manager.len(), 1);

        assert!(manager.take(1, tag).is_ok());

        // Already acked
        assert_eq!(manager.take(1, tag).unwrap_err(), AckStatus::AckRecordNotFound(tag));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_take_up_to() {
        let manager = AckManager::new();
        let records: Vec<AckRecord> = (0..4).map(|_| create_record(&manager, "ctag-1", 1)).collect();
        let tags: Vec<DeliveryTag> = records.iter().map(|r| r.delivery_tag).collect();
        let foreign = create_record(&manager, "ctag-2", 2);
        let foreign_tag = foreign.delivery_tag;
        for record in records {
            manager.add_record(record);
        }
        manager.add_record(foreign);

        let taken = manager.take_up_to(1, tags[2]).unwrap();
        let taken_tags: Vec<DeliveryTag> = taken.iter().map(|r| r.delivery_tag).collect();
        assert_eq!(taken_tags, tags[..3].to_vec());

        // The other connection's record and the newer one are untouched
        assert_eq!(manager.len(), 2);
        assert!(manager.take_up_to(1, foreign_tag).is_err());
        assert!(manager.take_up_to(1, tags[0]).is_err());
    }

    #[test]
    fn test_drain_consumer_and_connection() {
        let manager = AckManager::new();
        for _ in 0..3 {
            let record = create_record(&manager, "ctag-a", 7);
            manager.add_record(record);
        }
        let record = create_record(&manager, "ctag-b", 7);
        manager.add_record(record);

        assert_eq!(manager.pending_for_consumer("ctag-a"), 3);
        assert_eq!(manager.pending_for_queue(1), 4);

        let drained = manager.drain_consumer("ctag-a");
        assert_eq!(drained.len(), 3);
        assert!(drained.windows(2).all(|w| w[0].delivery_tag < w[1].delivery_tag));
        assert_eq!(manager.pending_for_consumer("ctag-a"), 0);

        let drained = manager.drain_connection(7);
        assert_eq!(drained.len(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_drain_queue_only_touches_that_instance() {
        let manager = AckManager::new();
        manager.add_record(create_record(&manager, "ctag-a", 1));
        manager.add_record(create_record(&manager, "ctag-a", 1));

        let mut recreated = create_record(&manager, "ctag-b", 1);
        recreated.queue_id = 2;
        let kept = recreated.delivery_tag;
        manager.add_record(recreated);

        assert_eq!(manager.drain_queue(1).len(), 2);
        assert_eq!(manager.pending_for_queue(1), 0);
        assert_eq!(manager.pending_for_queue(2), 1);
        assert!(manager.take(1, kept).is_ok());
    }
}
