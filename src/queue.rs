//! Capacity-limited FIFO shared between the real-time audio threads and the
//! async session loops.
//!
//! Pushing never blocks: when the queue is full the single oldest item is
//! evicted to make room, favouring recency over completeness. Pops can be
//! awaited, optionally with a timeout.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is raised to one.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Append an item, evicting and returning the oldest one if the queue was
    /// full. Safe to call from any thread.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        if evicted.is_some() {
            log::warn!("{} queue full, dropped oldest item", self.name);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait until an item is available. Cancel-safe: an item is only removed
    /// from the queue when it is returned.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Wait at most `wait` for an item.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        tokio::time::timeout(wait, self.pop()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
