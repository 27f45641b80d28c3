//! Bounded blocking job queue.
//!
//! Producers block while the queue is full; consumers block while it is
//! empty. Dequeueing reports closure and cancellation as explicit values so
//! workers never have to unwind out of a wait.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue<T> {
    Item(T),
    /// Closed and drained; no more work will arrive.
    Closed,
    /// Cancelled while waiting or before the call.
    Cancelled,
}

/// Rejected push; the item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    Closed(T),
    Cancelled(T),
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("queue is closed"),
            Self::Cancelled(_) => f.write_str("queue is cancelled"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Cancelled(item) => item,
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    cancelled: bool,
}

#[derive(Debug)]
pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> JobQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                cancelled: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while the queue is full.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Err(PushError::Cancelled(item));
            }
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available, the queue is closed and drained,
    /// or the queue is cancelled.
    pub fn take(&self) -> Dequeue<T> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Dequeue::Cancelled;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Dequeue::Item(item);
            }
            if state.closed {
                return Dequeue::Closed;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops accepting new items. Queued items can still be taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Wakes every waiter; pending and future `take` calls see `Cancelled`.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn items_come_out_in_fifo_order() {
        let queue = JobQueue::new(4);
        for item in 1..=3 {
            queue.push(item).expect("push");
        }
        assert_eq!(queue.take(), Dequeue::Item(1));
        assert_eq!(queue.take(), Dequeue::Item(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn closed_queue_drains_before_reporting_closed() {
        let queue = JobQueue::new(2);
        queue.push("a").expect("push");
        queue.close();
        assert_eq!(queue.push("b"), Err(PushError::Closed("b")));
        assert_eq!(queue.take(), Dequeue::Item("a"));
        assert_eq!(queue.take(), Dequeue::Closed);
    }

    #[test]
    fn cancel_wakes_a_blocked_consumer() {
        let queue = Arc::new(JobQueue::<u32>::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(20));
        queue.cancel();
        assert_eq!(consumer.join().expect("join"), Dequeue::Cancelled);
    }

    #[test]
    fn cancel_takes_priority_over_queued_items() {
        let queue = JobQueue::new(2);
        queue.push(7).expect("push");
        queue.cancel();
        assert!(queue.is_cancelled());
        assert_eq!(queue.take(), Dequeue::Cancelled);
        assert_eq!(queue.push(8).map_err(PushError::into_inner), Err(8));
    }

    #[test]
    fn full_queue_blocks_producer_until_space() {
        let queue = Arc::new(JobQueue::new(1));
        queue.push(1).expect("push");
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(), Dequeue::Item(1));
        producer.join().expect("join").expect("push after space");
        assert_eq!(queue.take(), Dequeue::Item(2));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = JobQueue::<()>::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.is_empty());
    }
}
