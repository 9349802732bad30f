//! Unbounded FIFO shared between the control thread and a transport loop.
//!
//! The control thread uses the blocking [`MessageQueue::pop`]; transport
//! event loops use [`MessageQueue::recv`]. Both see the same items in the
//! same order. Closing the queue wakes every waiter.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue pop timed out")]
    Timeout,
    #[error("queue closed")]
    Closed,
}

pub struct MessageQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
}

struct Slot<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    items: VecDeque::new(),
                    closed: false,
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Appends an item. Never blocks; returns false (dropping the item) once closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut slot = self.lock();
            if slot.closed {
                return false;
            }
            slot.items.push_back(item);
        }
        self.inner.ready.notify_all();
        self.inner.notify.notify_waiters();
        true
    }

    /// Blocks until an item arrives, the timeout elapses, or the queue is
    /// closed and drained. `None` waits indefinitely.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.lock();
        loop {
            if let Some(item) = slot.items.pop_front() {
                return Ok(item);
            }
            if slot.closed {
                return Err(QueueError::Closed);
            }
            slot = match deadline {
                None => self
                    .inner
                    .ready
                    .wait(slot)
                    .expect("message queue mutex poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout);
                    }
                    self.inner
                        .ready
                        .wait_timeout(slot, deadline - now)
                        .expect("message queue mutex poisoned")
                        .0
                }
            };
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Async pop for transport loops. `None` once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut slot = self.lock();
                if let Some(item) = slot.items.pop_front() {
                    return Some(item);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuses further pushes and wakes all waiters. Queued items stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.ready.notify_all();
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.inner
            .slot
            .lock()
            .expect("message queue mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn preserves_push_order() {
        let queue = MessageQueue::new();
        for value in 0..100 {
            assert!(queue.push(value));
        }
        let drained: Vec<i32> = (0..100).map(|_| queue.pop(None).unwrap()).collect();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue: MessageQueue<u8> = MessageQueue::new();
        let started = Instant::now();
        assert_eq!(
            queue.pop(Some(Duration::from_millis(30))),
            Err(QueueError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = MessageQueue::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push("reply");
        });
        assert_eq!(queue.pop(Some(Duration::from_secs(2))), Ok("reply"));
        handle.join().unwrap();
    }

    #[test]
    fn close_drains_then_fails() {
        let queue = MessageQueue::new();
        queue.push(1);
        queue.close();
        assert!(!queue.push(2));
        assert_eq!(queue.pop(None), Ok(1));
        assert_eq!(queue.pop(None), Err(QueueError::Closed));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let queue: MessageQueue<u8> = MessageQueue::new();
        let closer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert_eq!(queue.pop(None), Err(QueueError::Closed));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn async_recv_sees_sync_pushes() {
        let queue = MessageQueue::new();
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            for value in 0..3 {
                thread::sleep(Duration::from_millis(5));
                producer.push(value);
            }
            producer.close();
        });
        let mut seen = Vec::new();
        while let Some(value) = queue.recv().await {
            seen.push(value);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        handle.join().unwrap();
    }
}
