//! Long-lived subscriber delivery (spec.md §4.2, §5). A subscriber registers
//! a waiter; after every successful append batch the partition wakes every
//! subscriber whose requested offset is now available and pushes records
//! down a bounded `flume` channel, matching the producer/consumer channel
//! shape the teacher uses throughout `channels/commands/*.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use crate::record::PolledRecord;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

struct Subscriber {
    next_wanted: u64,
    sender: flume::Sender<PolledRecord>,
}

/// Shared subscriber registry. Deliberately holds no reference back to the
/// owning `Partition` — only a one-way registration, so a
/// [`SubscriptionHandle`] can cancel itself without creating a reference
/// cycle (spec.md §9).
#[derive(Default)]
pub(crate) struct SubscriberTable {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl SubscriberTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, from_offset: u64) -> (u64, flume::Receiver<PolledRecord>) {
        let (tx, rx) = flume::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(
            id,
            Subscriber {
                next_wanted: from_offset,
                sender: tx,
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Called by the partition after every successful append batch. Delivers
    /// every newly available record to every subscriber still waiting for it;
    /// a subscriber whose channel is full or disconnected is dropped rather
    /// than allowed to stall the append path.
    pub fn notify(&self, new_records: &[PolledRecord]) {
        if new_records.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter_mut() {
            for record in new_records {
                if record.offset < sub.next_wanted {
                    continue;
                }
                if sub.sender.try_send(record.clone()).is_err() {
                    dead.push(*id);
                    break;
                }
                sub.next_wanted = record.offset + 1;
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Hands a freshly registered subscriber its backlog directly, bypassing
    /// the `next_wanted` filter in [`Self::notify`] since the caller already
    /// knows exactly what to deliver. A record produced between `register`
    /// and this call is delivered twice in the rare case that `notify` wins
    /// the race; subscribers are expected to tolerate a replayed offset the
    /// same way a restarted consumer group would (spec.md §6).
    pub fn deliver_backlog(&self, id: u64, records: &[PolledRecord]) {
        if records.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(sub) = subscribers.get_mut(&id) {
            for record in records {
                if sub.sender.try_send(record.clone()).is_err() {
                    break;
                }
                sub.next_wanted = sub.next_wanted.max(record.offset + 1);
            }
        }
    }
}

/// Handle returned by `Partition::subscribe`. Dropping it or calling
/// [`SubscriptionHandle::cancel`] unregisters the waiter and releases the
/// send-side buffer (spec.md §5).
pub struct SubscriptionHandle {
    id: u64,
    table: Arc<SubscriberTable>,
    pub receiver: flume::Receiver<PolledRecord>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, table: Arc<SubscriberTable>, receiver: flume::Receiver<PolledRecord>) -> Self {
        Self { id, table, receiver }
    }

    pub fn cancel(self) {
        self.table.unregister(self.id);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.table.unregister(self.id);
    }
}
