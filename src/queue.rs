//! Bounded segment queues backing each connection's send and receive side.
//!
//! A segment is one `Vec<u8>` chunk. The queue is shared between a producer
//! side and a consumer side running on different threads; the consumer is
//! always the connection's owning event loop in one direction and user code
//! in the other. Event loops do not block, so they are woken through
//! registrable notify handlers instead of condvars: the data handler fires
//! when the queue goes empty -> non-empty, the space handler when it drops
//! back below capacity.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

type NotifyFn = Box<dyn Fn() + Send + Sync>;

struct Inner {
    segs: VecDeque<Vec<u8>>,
    closed: bool,
}

pub(crate) struct SegQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    capacity: usize,
    data_handler: Mutex<Option<NotifyFn>>,
    space_handler: Mutex<Option<NotifyFn>>,
}

impl SegQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                segs: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            data_handler: Mutex::new(None),
            space_handler: Mutex::new(None),
        }
    }

    /// Registers the handler fired on the empty -> non-empty edge.
    pub fn reg_data_handler(&self, f: NotifyFn) {
        *self.data_handler.lock().unwrap() = Some(f);
    }

    /// Registers the handler fired when a full queue regains space.
    pub fn reg_space_handler(&self, f: NotifyFn) {
        *self.space_handler.lock().unwrap() = Some(f);
    }

    pub fn unreg_handlers(&self) {
        *self.data_handler.lock().unwrap() = None;
        *self.space_handler.lock().unwrap() = None;
    }

    /// Marks the queue closed and wakes any blocked producers. Pushing into
    /// a closed queue fails; popping drains what is left.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_full.notify_all();
    }

    /// Appends a segment, blocking while the queue is at capacity.
    /// Returns `false` if the queue was closed.
    pub fn push(&self, seg: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.segs.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        let was_empty = inner.segs.is_empty();
        inner.segs.push_back(seg);
        drop(inner);
        if was_empty {
            self.fire(&self.data_handler);
        }
        true
    }

    /// Appends a segment without blocking. On a full or closed queue the
    /// segment is handed back so the caller can retry or drop it.
    pub fn try_push(&self, seg: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.segs.len() >= self.capacity {
            return Err(seg);
        }
        let was_empty = inner.segs.is_empty();
        inner.segs.push_back(seg);
        drop(inner);
        if was_empty {
            self.fire(&self.data_handler);
        }
        Ok(())
    }

    /// Pops the segment at the head, if any.
    pub fn move_pop(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let was_full = inner.segs.len() >= self.capacity;
        let seg = inner.segs.pop_front();
        let has_space = inner.segs.len() < self.capacity;
        drop(inner);
        if seg.is_some() && has_space {
            self.not_full.notify_one();
            if was_full {
                self.fire(&self.space_handler);
            }
        }
        seg
    }

    /// Puts a partially consumed segment back at the head. Never blocks and
    /// may transiently exceed capacity; only the consumer calls this.
    pub fn rewind(&self, seg: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.segs.push_front(seg);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().segs.is_empty()
    }

    pub fn has_space(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.closed && inner.segs.len() < self.capacity
    }

    fn fire(&self, slot: &Mutex<Option<NotifyFn>>) {
        if let Some(f) = slot.lock().unwrap().as_ref() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let q = SegQueue::new(8);
        q.push(vec![1]);
        q.push(vec![2]);
        q.push(vec![3]);
        assert_eq!(q.move_pop(), Some(vec![1]));
        assert_eq!(q.move_pop(), Some(vec![2]));
        assert_eq!(q.move_pop(), Some(vec![3]));
        assert_eq!(q.move_pop(), None);
    }

    #[test]
    fn rewind_goes_back_to_the_head() {
        let q = SegQueue::new(8);
        q.push(vec![1, 2, 3]);
        q.push(vec![4]);
        let seg = q.move_pop().unwrap();
        q.rewind(seg[1..].to_vec());
        assert_eq!(q.move_pop(), Some(vec![2, 3]));
        assert_eq!(q.move_pop(), Some(vec![4]));
    }

    #[test]
    fn data_handler_fires_on_empty_edge_only() {
        let q = SegQueue::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        q.reg_data_handler(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        q.push(vec![1]);
        q.push(vec![2]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        q.move_pop();
        q.move_pop();
        q.push(vec![3]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn full_queue_blocks_producer_until_pop() {
        let q = Arc::new(SegQueue::new(2));
        q.push(vec![0]);
        q.push(vec![1]);
        let q2 = q.clone();
        let producer = thread::spawn(move || q2.push(vec![2]));
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(q.move_pop(), Some(vec![0]));
        assert!(producer.join().unwrap());
        assert_eq!(q.move_pop(), Some(vec![1]));
        assert_eq!(q.move_pop(), Some(vec![2]));
    }

    #[test]
    fn close_unblocks_and_rejects_producers() {
        let q = Arc::new(SegQueue::new(1));
        q.push(vec![0]);
        let q2 = q.clone();
        let producer = thread::spawn(move || q2.push(vec![1]));
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(!producer.join().unwrap());
        assert!(!q.push(vec![2]));
        // drain still works after close
        assert_eq!(q.move_pop(), Some(vec![0]));
    }

    #[test]
    fn space_handler_fires_when_full_queue_drains() {
        let q = SegQueue::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        q.reg_space_handler(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        q.push(vec![0]);
        q.push(vec![1]);
        q.move_pop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        q.move_pop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
