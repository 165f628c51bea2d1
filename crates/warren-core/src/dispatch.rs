//! Fair dispatch of queued messages to attached consumers.
//!
//! All operations here run under the queue's state lock, which makes the
//! queue the single owner of its messages: a message is either ready in the
//! queue, outstanding at exactly one consumer, or settled.
//!
//! Dispatch is push based. Enqueue, requeue, ack, and credit release all end
//! by calling [`Queue::dispatch_locked`], which pairs the head message with
//! the first ready consumer in rotation order and moves that consumer to the
//! back. A consumer is ready while it holds fewer outstanding deliveries than
//! its prefetch limit (zero means unlimited).

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use warren_acks::AckRecord;
use warren_internals::{ConnectionId, ConsumerTag, Delivery, WarrenError};

use crate::queue::{Queue, QueueEntry, QueueState};

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

pub(crate) struct ConsumerSlot {
    pub(crate) tag: ConsumerTag,
    connection_id: ConnectionId,
    auto_ack: bool,
    prefetch: u16,
    outstanding: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn is_ready(&self) -> bool {
        self.prefetch == 0 || self.outstanding < self.prefetch as usize
    }

    fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

/// Receiving end of a subscription. Ends when the consumer is cancelled,
/// its connection closes, or its queue is deleted.
pub struct Consumer {
    tag: ConsumerTag,
    queue_name: String,
    stream: DeliveryStream,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Consumer {
    /// Runs `hook` once when the consumer is dropped.
    pub fn on_drop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        futures::StreamExt::next(&mut self.stream).await
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl Queue {
    /// Attaches a consumer and immediately offers it any ready messages.
    pub fn attach(
        self: &Arc<Self>,
        tag: ConsumerTag,
        connection_id: ConnectionId,
        auto_ack: bool,
        prefetch: u16,
    ) -> Result<Consumer, WarrenError> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        {
            let mut state = self.lock_state()?;
            if state.deleted {
                return Err(WarrenError::QueueNotFound(self.name.clone()));
            }
            if state.consumers.iter().any(|c| c.tag == tag) {
                return Err(WarrenError::ConsumerTagInUse(tag));
            }
            state.consumers.push_back(ConsumerSlot {
                tag: tag.clone(),
                connection_id,
                auto_ack,
                prefetch,
                outstanding: 0,
                sender,
            });
            self.dispatch_locked(&mut state);
        }

        // Auto-ack deliveries count against prefetch until the consumer pulls them.
        let credit_queue = auto_ack.then(|| Arc::clone(self));
        let credit_tag = tag.clone();
        let stream = async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                if let Some(queue) = &credit_queue {
                    queue.release_credit(&credit_tag);
                }
                yield delivery;
            }
        };

        Ok(Consumer {
            tag,
            queue_name: self.name.clone(),
            stream: Box::pin(stream),
            on_drop: None,
        })
    }

    /// Detaches a consumer and requeues its unacknowledged deliveries at the
    /// head, in their original order. Returns the number requeued.
    pub fn detach(&self, tag: &str) -> Result<usize, WarrenError> {
        let mut state = self.lock_state()?;
        state.consumers.retain(|c| c.tag != tag);

        let records = self.acks.drain_consumer(tag);
        let requeued = Self::requeue_locked(&mut state, records);
        if requeued > 0 {
            debug!(queue_name = %self.name, consumer_tag = %tag, requeued, "requeued unacked deliveries");
        }
        self.dispatch_locked(&mut state);
        Ok(requeued)
    }

    /// Finalizes an acknowledged delivery. Records of another queue instance
    /// with the same name are ignored.
    pub fn settle(&self, record: &AckRecord) -> Result<(), WarrenError> {
        if record.queue_id != self.id() {
            return Ok(());
        }
        let mut state = self.lock_state()?;
        Self::release_slot(&mut state, record);
        if state.deleted {
            return Ok(());
        }
        if self.persists(&record.message) {
            self.store.remove_message(&self.name, record.seq)?;
        }
        self.dispatch_locked(&mut state);
        Ok(())
    }

    /// Negative acknowledgement: requeue at the head or discard.
    pub fn reject(&self, record: AckRecord, requeue: bool) -> Result<(), WarrenError> {
        if record.queue_id != self.id() {
            return Ok(());
        }
        let mut state = self.lock_state()?;
        Self::release_slot(&mut state, &record);
        if state.deleted {
            return Ok(());
        }
        if requeue {
            Self::requeue_locked(&mut state, vec![record]);
        } else if self.persists(&record.message) {
            self.store.remove_message(&self.name, record.seq)?;
        }
        self.dispatch_locked(&mut state);
        Ok(())
    }

    /// Returns deliveries taken back from a terminated connection to the head.
    pub fn requeue(&self, mut records: Vec<AckRecord>) -> Result<usize, WarrenError> {
        records.retain(|record| record.queue_id == self.id());
        let mut state = self.lock_state()?;
        if state.deleted {
            return Ok(0);
        }
        for record in &records {
            Self::release_slot(&mut state, record);
        }
        let requeued = Self::requeue_locked(&mut state, records);
        self.dispatch_locked(&mut state);
        Ok(requeued)
    }

    /// Synchronous pull of the head message, bypassing attached consumers.
    pub fn fetch(
        &self,
        connection_id: ConnectionId,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, WarrenError> {
        let mut state = self.lock_state()?;
        if state.deleted {
            return Err(WarrenError::QueueNotFound(self.name.clone()));
        }
        let Some(entry) = state.messages.pop_front() else {
            return Ok(None);
        };

        let delivery_tag = self.acks.next_delivery_tag();
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: None,
            redelivered: entry.redelivered,
            message: entry.message.clone(),
        };

        if auto_ack {
            self.forget_entry(&entry);
        } else {
            self.acks.add_record(AckRecord::new(
                delivery_tag,
                None,
                connection_id,
                self.name.clone(),
                self.id(),
                entry.seq,
                entry.message,
            ));
        }
        Ok(Some(delivery))
    }

    /// Called when an auto-ack consumer takes a delivery off its channel.
    pub(crate) fn release_credit(&self, tag: &str) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        if let Some(slot) = state.consumers.iter_mut().find(|c| c.tag == tag) {
            slot.release();
        }
        self.dispatch_locked(&mut state);
    }

    pub(crate) fn dispatch_locked(&self, state: &mut QueueState) {
        while !state.messages.is_empty() {
            let Some(position) = state.consumers.iter().position(ConsumerSlot::is_ready) else {
                break;
            };
            let Some(mut slot) = state.consumers.remove(position) else {
                break;
            };
            let Some(entry) = state.messages.pop_front() else {
                state.consumers.insert(position, slot);
                break;
            };

            let delivery_tag = self.acks.next_delivery_tag();
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: Some(slot.tag.clone()),
                redelivered: entry.redelivered,
                message: entry.message.clone(),
            };

            // Track before handing off so an immediate ack always finds its record.
            if !slot.auto_ack {
                self.acks.add_record(AckRecord::new(
                    delivery_tag,
                    Some(slot.tag.clone()),
                    slot.connection_id,
                    self.name.clone(),
                    self.id(),
                    entry.seq,
                    entry.message.clone(),
                ));
            }

            if slot.sender.send(delivery).is_err() {
                // Receiver dropped without a cancel: the consumer is gone.
                debug!(queue_name = %self.name, consumer_tag = %slot.tag, "dropping vanished consumer");
                if !slot.auto_ack {
                    let _ = self.acks.take(slot.connection_id, delivery_tag);
                }
                state.messages.push_front(entry);
                let records = self.acks.drain_consumer(&slot.tag);
                Self::requeue_locked(state, records);
                continue;
            }

            slot.outstanding += 1;
            if slot.auto_ack {
                self.forget_entry(&entry);
            }
            state.consumers.push_back(slot);
        }
    }

    fn requeue_locked(state: &mut QueueState, records: Vec<AckRecord>) -> usize {
        let requeued = records.len();
        // Oldest delivery ends up first.
        for record in records.into_iter().rev() {
            state.messages.push_front(QueueEntry {
                seq: record.seq,
                message: record.message,
                redelivered: true,
            });
        }
        requeued
    }

    fn release_slot(state: &mut QueueState, record: &AckRecord) {
        let Some(tag) = record.consumer_tag.as_deref() else {
            return;
        };
        if let Some(slot) = state.consumers.iter_mut().find(|c| c.tag == tag) {
            slot.release();
        }
    }

    /// Removes a message that will never be redelivered from the store.
    fn forget_entry(&self, entry: &QueueEntry) {
        if self.persists(&entry.message) {
            if let Err(e) = self.store.remove_message(&self.name, entry.seq) {
                warn!(queue_name = %self.name, error = %e, "failed to remove delivered message from store");
            }
        }
    }
}
