use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, warn};
use warren_acks::AckManager;
use warren_internals::{ConnectionId, Message, QueueOptions, WarrenError};

use crate::dispatch::ConsumerSlot;
use crate::store::MessageStore;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared services every queue needs: delivery tracking and durable storage.
#[derive(Clone)]
pub struct QueueContext {
    pub acks: Arc<AckManager>,
    pub store: Arc<dyn MessageStore>,
    pub max_capacity: usize,
}

pub(crate) struct QueueEntry {
    pub(crate) seq: u64,
    pub(crate) message: Message,
    pub(crate) redelivered: bool,
}

pub(crate) struct QueueState {
    pub(crate) messages: VecDeque<QueueEntry>,
    /// Round-robin rotation: the front is offered the next message first.
    pub(crate) consumers: VecDeque<ConsumerSlot>,
    pub(crate) next_seq: u64,
    pub(crate) deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub messages_ready: usize,
    pub messages_unacknowledged: usize,
    pub consumers: usize,
}

pub struct Queue {
    pub name: String,
    /// Distinguishes this instance from a later queue declared under the same name.
    id: u64,
    options: QueueOptions,
    owner: Option<ConnectionId>,
    pub(crate) state: Mutex<QueueState>,
    max_capacity: usize,
    pub(crate) acks: Arc<AckManager>,
    pub(crate) store: Arc<dyn MessageStore>,
}

impl Queue {
    pub fn new(
        name: String,
        options: QueueOptions,
        owner: Option<ConnectionId>,
        context: QueueContext,
    ) -> Self {
        Self {
            name,
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            options,
            owner,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                consumers: VecDeque::new(),
                next_seq: 1,
                deleted: false,
            }),
            max_capacity: context.max_capacity,
            acks: context.acks,
            store: context.store,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    pub fn is_durable(&self) -> bool {
        self.options.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.options.exclusive
    }

    /// Connection that declared an exclusive queue.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Whether `connection_id` may use this queue.
    pub fn is_accessible_by(&self, connection_id: ConnectionId) -> bool {
        self.owner.map_or(true, |owner| owner == connection_id)
    }

    /// Durable queue and persistent message must both opt in.
    pub(crate) fn persists(&self, message: &Message) -> bool {
        self.options.durable && !self.options.exclusive && message.is_persistent()
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, QueueState>, WarrenError> {
        self.state
            .lock()
            .map_err(|_| WarrenError::InternalError("Mutex poisoned".to_string()))
    }

    pub fn enqueue(&self, mut msg: Message) -> Result<(), WarrenError> {
        if let Some(ref mut meta) = msg.metadata {
            meta.arrival_time = Some(Instant::now());
        }

        let mut state = self.lock_state()?;
        if state.deleted {
            return Err(WarrenError::QueueNotFound(self.name.clone()));
        }
        if state.messages.len() >= self.max_capacity {
            return Err(WarrenError::QueueFull(self.name.clone()));
        }

        let seq = state.next_seq;
        if self.persists(&msg) {
            self.store.append_message(&self.name, seq, &msg)?;
        }
        state.next_seq += 1;
        state.messages.push_back(QueueEntry {
            seq,
            message: msg,
            redelivered: false,
        });

        self.dispatch_locked(&mut state);
        Ok(())
    }

    /// Loads messages recovered from the store, already in `seq` order.
    pub fn restore(&self, entries: Vec<(u64, Message)>) -> Result<usize, WarrenError> {
        let mut state = self.lock_state()?;
        let restored = entries.len();
        for (seq, message) in entries {
            state.next_seq = state.next_seq.max(seq + 1);
            state.messages.push_back(QueueEntry {
                seq,
                message,
                redelivered: false,
            });
        }
        self.dispatch_locked(&mut state);
        Ok(restored)
    }

    /// Number of messages ready for delivery.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().map(|s| s.consumers.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> Result<QueueStats, WarrenError> {
        let state = self.lock_state()?;
        Ok(QueueStats {
            name: self.name.clone(),
            messages_ready: state.messages.len(),
            messages_unacknowledged: self.acks.pending_for_queue(self.id),
            consumers: state.consumers.len(),
        })
    }

    /// Drops every ready message. Unacknowledged deliveries are untouched.
    pub fn purge(&self) -> Result<usize, WarrenError> {
        let mut state = self.lock_state()?;
        let purged = state.messages.len();
        for entry in state.messages.drain(..) {
            if self.persists(&entry.message) {
                if let Err(e) = self.store.remove_message(&self.name, entry.seq) {
                    warn!(queue_name = %self.name, error = %e, "failed to remove purged message from store");
                }
            }
        }
        Ok(purged)
    }

    /// Marks the queue deleted, ends consumer streams and discards ready
    /// messages along with every unacknowledged delivery.
    /// Returns the number of discarded ready messages.
    pub fn close(&self) -> Result<usize, WarrenError> {
        let mut state = self.lock_state()?;
        state.deleted = true;
        state.consumers.clear();
        let discarded = state.messages.len();
        state.messages.clear();
        let unacked = self.acks.drain_queue(self.id);
        if !unacked.is_empty() {
            debug!(queue_name = %self.name, unacked = unacked.len(), "dropped unacknowledged deliveries of deleted queue");
        }
        Ok(discarded)
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().map(|s| s.deleted).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use warren_internals::MessageProperties;

    fn test_context(store: Arc<dyn MessageStore>, max_capacity: usize) -> QueueContext {
        QueueContext {
            acks: Arc::new(AckManager::new()),
            store,
            max_capacity,
        }
    }

    fn create_incoming_msg(body: &str, persistent: bool) -> Message {
        let properties = if persistent {
            MessageProperties::persistent()
        } else {
            MessageProperties::default()
        };
        Message::new("", "task_queue", body.as_bytes().to_vec(), properties)
    }

    #[test]
    fn test_enqueue_stamps_arrival_time() {
        let queue = Queue::new(
            "timestamp_q".into(),
            QueueOptions::default(),
            None,
            test_context(Arc::new(MemoryStore::new()), 10),
        );
        queue.enqueue(create_incoming_msg("hello", false)).unwrap();

        let state = queue.lock_state().unwrap();
        let metadata = state.messages[0].message.metadata.as_ref().unwrap();
        assert!(metadata.arrival_time.is_some());
        assert!(metadata.published_at.is_some());
    }

    #[test]
    fn test_queue_fifo_integrity() {
        let queue = Queue::new(
            "fifo_q".into(),
            QueueOptions::default(),
            None,
            test_context(Arc::new(MemoryStore::new()), 10),
        );
        for body in ["one", "two", "three"] {
            queue.enqueue(create_incoming_msg(body, false)).unwrap();
        }

        let state = queue.lock_state().unwrap();
        let bodies: Vec<&[u8]> = state
            .messages
            .iter()
            .map(|e| e.message.payload.as_slice())
            .collect();
        assert_eq!(bodies, vec![b"one".as_slice(), b"two".as_slice(), b"three".as_slice()]);
        let seqs: Vec<u64> = state.messages.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_backpressure_limit() {
        let queue = Queue::new(
            "limit_q".into(),
            QueueOptions::default(),
            None,
            test_context(Arc::new(MemoryStore::new()), 1),
        );
        queue.enqueue(create_incoming_msg("first", false)).unwrap();

        match queue.enqueue(create_incoming_msg("second", false)) {
            Err(WarrenError::QueueFull(name)) => assert_eq!(name, "limit_q"),
            other => panic!("Expected QueueFull error, got {:?}", other),
        }
    }

    #[test]
    fn test_only_persistent_messages_in_durable_queues_are_stored() {
        let store = Arc::new(MemoryStore::new());
        let durable = Queue::new(
            "durable_q".into(),
            QueueOptions::durable(),
            None,
            test_context(store.clone(), 10),
        );
        let transient = Queue::new(
            "transient_q".into(),
            QueueOptions::default(),
            None,
            test_context(store.clone(), 10),
        );

        durable.enqueue(create_incoming_msg("kept", true)).unwrap();
        durable.enqueue(create_incoming_msg("lost", false)).unwrap();
        transient.enqueue(create_incoming_msg("lost too", true)).unwrap();

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages["durable_q"].len(), 1);
        assert_eq!(snapshot.messages["durable_q"][0].0, 1);
    }

    #[test]
    fn test_restore_continues_sequence() {
        let store = Arc::new(MemoryStore::new());
        let queue = Queue::new(
            "durable_q".into(),
            QueueOptions::durable(),
            None,
            test_context(store.clone(), 10),
        );
        let restored = queue
            .restore(vec![
                (4, create_incoming_msg("a", true)),
                (9, create_incoming_msg("b", true)),
            ])
            .unwrap();
        assert_eq!(restored, 2);

        queue.enqueue(create_incoming_msg("c", true)).unwrap();
        let state = queue.lock_state().unwrap();
        assert_eq!(state.messages.back().unwrap().seq, 10);
    }

    #[test]
    fn test_purge_removes_stored_messages() {
        let store = Arc::new(MemoryStore::new());
        let queue = Queue::new(
            "durable_q".into(),
            QueueOptions::durable(),
            None,
            test_context(store.clone(), 10),
        );
        queue.enqueue(create_incoming_msg("a", true)).unwrap();
        queue.enqueue(create_incoming_msg("b", true)).unwrap();

        assert_eq!(queue.purge().unwrap(), 2);
        assert!(queue.is_empty());
        assert!(store.load().unwrap().messages.is_empty());
    }

    #[test]
    fn test_closed_queue_rejects_messages() {
        let queue = Queue::new(
            "closing_q".into(),
            QueueOptions::default(),
            None,
            test_context(Arc::new(MemoryStore::new()), 10),
        );
        queue.enqueue(create_incoming_msg("a", false)).unwrap();
        assert_eq!(queue.close().unwrap(), 1);
        assert!(queue.is_deleted());
        assert!(matches!(
            queue.enqueue(create_incoming_msg("b", false)),
            Err(WarrenError::QueueNotFound(_))
        ));
    }

    #[test]
    fn test_exclusive_queue_access() {
        let queue = Queue::new(
            "amq.gen-test".into(),
            QueueOptions::exclusive(),
            Some(3),
            test_context(Arc::new(MemoryStore::new()), 10),
        );
        assert!(queue.is_accessible_by(3));
        assert!(!queue.is_accessible_by(4));
    }

    #[test]
    fn test_concurrent_enqueueing() {
        use std::thread;

        let queue = Arc::new(Queue::new(
            "concurrent_q".into(),
            QueueOptions::default(),
            None,
            test_context(Arc::new(MemoryStore::new()), 100),
        ));
        let mut handles = vec![];

        for _ in 0..10 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    q.enqueue(create_incoming_msg("x", false)).unwrap();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(queue.len(), 100);
    }
}
