use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Lock-free multi-producer/multi-consumer ready queue.
///
/// Producers never block; consumers park on a notify until an item arrives.
/// Every push posts one wake-up, so wake-ups and items stay in balance under
/// concurrent producers and consumers.
pub struct ReadyQueue<T> {
    queue: SegQueue<T>,
    size: AtomicUsize,
    available: Notify,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            size: AtomicUsize::new(0),
            available: Notify::new(),
        }
    }

    /// Enqueue an item. Never blocks, never fails.
    pub fn push(&self, item: T) {
        self.queue.push(item);
        self.size.fetch_add(1, Ordering::AcqRel);
        self.available.notify_one();
    }

    /// Non-blocking dequeue.
    pub fn pop(&self) -> Option<T> {
        let item = self.queue.pop();
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Dequeue, suspending until an item is available.
    ///
    /// Wake-ups posted while no consumer is parked collapse into a single
    /// stored permit, so a successful consumer re-posts the wake-up when work
    /// remains, keeping the remaining consumers live.
    pub async fn pop_wait(&self) -> T {
        loop {
            if let Some(item) = self.pop() {
                if !self.is_empty() {
                    self.available.notify_one();
                }
                return item;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn basic_operations() {
        let queue = ReadyQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_push_pop() {
        let queue = Arc::new(ReadyQueue::new());
        let num_threads = 8;
        let items_per_thread = 200;

        let mut handles = vec![];

        for i in 0..num_threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..items_per_thread {
                    queue.push(i * items_per_thread + j);
                }
            }));
        }

        for _ in 0..num_threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while count < items_per_thread {
                    if queue.pop().is_some() {
                        count += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn pop_wait_wakes_on_push() {
        let queue = Arc::new(ReadyQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_wait().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(42u32);

        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn multiple_waiters_each_get_one_item() {
        let queue = Arc::new(ReadyQueue::new());

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move { queue.pop_wait().await }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        for i in 0..4 {
            queue.push(i);
        }

        let mut seen: Vec<i32> = Vec::new();
        for consumer in consumers {
            seen.push(consumer.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }
}
