//! Fixed-capacity FIFO shared between pipeline stages.
//!
//! `BoundedChannel` is the only synchronization point between a producer
//! and a consumer thread. Items live in a ring of `capacity` slots guarded
//! by one mutex; producers park on `not_full`, consumers on `not_empty`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

pub struct BoundedChannel<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedChannel<T> {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded channel capacity must be non-zero");
        Self {
            capacity,
            ring: Mutex::new(Ring::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    /// Blocks until a slot is free, then enqueues.
    pub fn put(&self, item: T) {
        let mut ring = self.ring.lock();
        while ring.is_full() {
            self.not_full.wait(&mut ring);
        }
        ring.push(item);
        drop(ring);
        self.not_empty.notify_one();
    }

    /// Enqueues only if a slot is free right now. A full channel hands the
    /// item back to the caller.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            return Err(item);
        }
        ring.push(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Like `put`, but gives up and returns the item once `timeout` elapses.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        while ring.is_full() {
            if self.not_full.wait_until(&mut ring, deadline).timed_out() && ring.is_full() {
                return Err(item);
            }
        }
        ring.push(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available and dequeues it.
    pub fn get(&self) -> T {
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.pop() {
                drop(ring);
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut ring);
        }
    }

    pub fn try_get(&self) -> Option<T> {
        let item = self.ring.lock().pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.pop() {
                drop(ring);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut ring, deadline).timed_out() {
                let item = ring.pop();
                drop(ring);
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
