//! Delays and deduplicates pending work items.
//!
//! Bursts of input changes for the same item coalesce within the debounce
//! window into a single emission; explicit delays (retry backoff) reuse the
//! same queue.
use futures::future::poll_fn;
use hashbrown::{hash_map::Entry, HashMap};
use std::hash::Hash;
use std::task::Poll;
use std::time::Duration;
use tokio_util::time::delay_queue::{self, DelayQueue};

pub(crate) struct DebounceQueue<T: Clone + Eq + Hash> {
    queue: DelayQueue<T>,
    scheduled: HashMap<T, delay_queue::Key>,
    debounce: Duration,
}

impl<T: Clone + Eq + Hash> DebounceQueue<T> {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            debounce,
        }
    }

    /// Schedules `item` after the debounce window. If it is already queued
    /// its deadline is pushed out, coalescing the burst.
    pub(crate) fn insert(&mut self, item: T) {
        self.insert_after(item, self.debounce);
    }

    /// Schedules `item` after an explicit delay (retry backoff).
    pub(crate) fn insert_after(&mut self, item: T, delay: Duration) {
        match self.scheduled.entry(item.clone()) {
            Entry::Occupied(entry) => {
                self.queue.reset(entry.get(), delay);
            }
            Entry::Vacant(entry) => {
                let key = self.queue.insert(item, delay);
                entry.insert(key);
            }
        }
    }

    /// Waits for the next due item. Pending while the queue is empty, so it
    /// is safe to poll inside a select loop that also inserts.
    pub(crate) async fn next(&mut self) -> T {
        poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let item = expired.into_inner();
                self.scheduled.remove(&item);
                Poll::Ready(item)
            }
            // Empty queue: stay pending, the caller's loop re-polls after
            // inserting.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }
}
