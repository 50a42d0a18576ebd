//! C2 — bounded, stoppable FIFO used as both a transport inbox and a data
//! channel/track receive buffer (spec §4.1).
//!
//! The amount accounted against `limit` is caller-defined via `amount_fn`,
//! so the same queue type backs both "N messages" and "N bytes" policies.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    items: VecDeque<T>,
    amount: usize,
    stopped: bool,
}

/// A bounded multi-producer/single-consumer queue with stop semantics.
///
/// `push` blocks (cooperatively, via condvar wait) while `amount >= limit`
/// unless the queue has been stopped, in which case it returns immediately
/// without enqueuing. `pop` blocks until non-empty or stopped.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    limit: usize,
    amount_fn: Box<dyn Fn(&T) -> usize + Send + Sync>,
}

impl<T: Send> Queue<T> {
    pub fn new(limit: usize) -> Self {
        Self::with_amount_fn(limit, |_| 1)
    }

    pub fn with_amount_fn(limit: usize, amount_fn: impl Fn(&T) -> usize + Send + Sync + 'static) -> Self {
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                amount: 0,
                stopped: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            limit,
            amount_fn: Box::new(amount_fn),
        }
    }

    /// Blocks while full and not stopped, then enqueues. Returns `false`
    /// without enqueuing if the queue was already stopped.
    pub fn push(&self, item: T) -> bool {
        let amount = (self.amount_fn)(&item);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.stopped {
                return false;
            }
            if guard.amount < self.limit || guard.items.is_empty() {
                // Always admit at least one item even if it alone exceeds
                // the limit, so a single oversize element can't deadlock
                // the producer forever.
                guard.items.push_back(item);
                guard.amount += amount;
                self.not_empty.notify_one();
                return true;
            }
            guard = self.not_full.wait(guard).unwrap();
        }
    }

    /// Blocks until an item is available or the queue is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                guard.amount = guard.amount.saturating_sub((self.amount_fn)(&item));
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.stopped {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Like `pop`, but gives up after `timeout` if still empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                guard.amount = guard.amount.saturating_sub((self.amount_fn)(&item));
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.stopped {
                return None;
            }
            let (g, result) = self.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if result.timed_out() && guard.items.is_empty() {
                return None;
            }
        }
    }

    /// Returns a clone of the front item without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().unwrap().items.front().cloned()
    }

    /// Atomically replaces the front item, returning the old one. Used by
    /// handlers that need to mutate a still-queued message in place.
    pub fn exchange(&self, item: T) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(front) = guard.items.front_mut() {
            Some(std::mem::replace(front, item))
        } else {
            None
        }
    }

    /// Blocks the calling thread until the queue is non-empty or stopped
    /// (or `timeout` elapses), without consuming anything.
    pub fn wait(&self, timeout: Option<Duration>) {
        let mut guard = self.inner.lock().unwrap();
        while guard.items.is_empty() && !guard.stopped {
            guard = match timeout {
                Some(d) => {
                    let (g, result) = self.not_empty.wait_timeout(guard, d).unwrap();
                    if result.timed_out() {
                        return;
                    }
                    g
                }
                None => self.not_empty.wait(guard).unwrap(),
            };
        }
    }

    /// Idempotent. Wakes every waiter; subsequent `pop`s observe the queue
    /// as permanently empty, `push`s are refused.
    pub fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn amount(&self) -> usize {
        self.inner.lock().unwrap().amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_preserves_order() {
        let q: Queue<i32> = Queue::new(10);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn stop_wakes_blocked_pop() {
        let q = Arc::new(Queue::<i32>::new(10));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn stop_is_idempotent_and_refuses_further_push() {
        let q: Queue<i32> = Queue::new(10);
        q.stop();
        q.stop();
        assert!(!q.push(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn amount_accounting_tracks_custom_fn() {
        let q: Queue<Vec<u8>> = Queue::with_amount_fn(100, |v| v.len());
        q.push(vec![0u8; 10]);
        q.push(vec![0u8; 20]);
        assert_eq!(q.amount(), 30);
        q.pop();
        assert_eq!(q.amount(), 20);
    }

    #[test]
    fn push_blocks_while_full_until_pop_drains() {
        let q = Arc::new(Queue::<i32>::with_amount_fn(1, |_| 1));
        assert!(q.push(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.push(2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop(), Some(1));
        assert!(handle.join().unwrap());
        assert_eq!(q.pop(), Some(2));
    }
}
