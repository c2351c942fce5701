use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct Slot {
    seq: u64,
    handle: JoinHandle<()>,
}

/// Deferred tasks with one slot per key: scheduling for a key that already
/// has a pending task cancels it and restarts the window.
///
/// A task leaves its slot before it starts running, so once the window has
/// elapsed the work is never aborted by a later `schedule` or `cancel`.
pub struct Debouncer<K> {
    window: Duration,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    next_seq: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn schedule<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let window = self.window;
        let slots = Arc::clone(&self.slots);
        let slot_key = key.clone();

        let mut guard = self.slots.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut slots = slots.lock();
                match slots.get(&slot_key) {
                    Some(slot) if slot.seq == seq => {
                        slots.remove(&slot_key);
                    }
                    _ => return,
                }
            }
            task.await;
        });

        if let Some(previous) = guard.insert(key, Slot { seq, handle }) {
            previous.handle.abort();
        }
    }

    /// Drops the pending task for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> Vec<K> {
        let drained: Vec<(K, Slot)> = self.slots.lock().drain().collect();
        drained
            .into_iter()
            .map(|(key, slot)| {
                slot.handle.abort();
                key
            })
            .collect()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<K> {
        self.slots.lock().keys().cloned().collect()
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, slot) in self.slots.lock().drain() {
            slot.handle.abort();
        }
    }
}
