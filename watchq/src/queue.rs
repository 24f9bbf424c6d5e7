use log::debug;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Unbounded FIFO bridge between the producer thread and the polling
/// consumer. One producer appends, the consumer drains everything queued in
/// one pass; neither side ever blocks on the other beyond the lock.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        debug!("queue depth: {}", items.len());
    }

    /// Remove and return every queued item in production order. Returns an
    /// empty vec when nothing is pending.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.lock();
        let mut drained = Vec::with_capacity(items.len());
        while let Some(item) = items.pop_front() {
            drained.push(item);
        }
        drained
    }

    // A panicking holder of the lock must not silence the producer for the
    // rest of the process lifetime.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn drain_returns_items_in_production_order() {
        let queue = EventQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn drain_on_empty_queue_is_empty() {
        let queue: EventQueue<u32> = EventQueue::new();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn concurrent_production_loses_nothing() {
        let queue = Arc::new(EventQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.push(i);
                }
            })
        };

        let mut drained = Vec::new();
        while drained.len() < 1000 {
            drained.extend(queue.drain());
            thread::sleep(Duration::from_millis(1));
        }
        producer.join().unwrap();
        drained.extend(queue.drain());

        // every item exactly once, and FIFO means the single producer's
        // order survives across drains
        assert_eq!(drained.len(), 1000);
        assert!(drained.windows(2).all(|w| w[0] < w[1]));
    }
}
