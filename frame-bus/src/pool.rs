//! Double-queue buffer pool.
//!
//! A `FramePool` owns a fixed working set of N buffers that cycle between an
//! "empty" channel and a "full" channel:
//!
//! ```text
//!            borrow_empty             submit
//! [empty] ───────────────► producer ─────────► [full]
//!    ▲                                            │
//!    │           recycle                take_full │
//!    └──────────────────── consumer ◄─────────────┘
//! ```
//!
//! All N buffers are allocated up front; nothing is allocated afterwards.
//! Ownership changes only through these calls, so a buffer is never readable
//! and writable at the same time. Every slot carries a ledger entry so the
//! pool can account for buffers that are out of both channels.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::channel::BoundedChannel;
use crate::frame::FrameCmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Full = 1,
    Producer = 2,
    Consumer = 3,
    Released = 4,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotState::Empty,
            1 => SlotState::Full,
            2 => SlotState::Producer,
            3 => SlotState::Consumer,
            _ => SlotState::Released,
        }
    }
}

/// Exclusive handle to one pooled buffer. Moving the slot moves ownership;
/// it cannot be cloned.
pub struct Slot<B> {
    index: usize,
    buf: B,
}

impl<B> Slot<B> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<B> Deref for Slot<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.buf
    }
}

impl<B> DerefMut for Slot<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.buf
    }
}

/// Point-in-time ledger counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Census {
    pub empty: usize,
    pub full: usize,
    pub producer: usize,
    pub consumer: usize,
    pub released: usize,
}

impl Census {
    pub fn checked_out(&self) -> usize {
        self.producer + self.consumer
    }

    pub fn live(&self) -> usize {
        self.empty + self.full + self.checked_out()
    }
}

pub struct FramePool<B> {
    capacity: usize,
    empty: BoundedChannel<Slot<B>>,
    full: BoundedChannel<FrameCmd<B>>,
    ledger: Box<[AtomicU8]>,
}

impl<B> FramePool<B> {
    /// Allocates `capacity` buffers with `alloc` and parks them all in the
    /// empty channel. Fails before anything is shared if any allocation fails.
    pub fn new<F>(capacity: usize, mut alloc: F) -> anyhow::Result<Self>
    where
        F: FnMut(usize) -> anyhow::Result<B>,
    {
        if capacity == 0 {
            anyhow::bail!("frame pool capacity must be non-zero");
        }
        let empty = BoundedChannel::new(capacity);
        for index in 0..capacity {
            let buf = alloc(index)
                .map_err(|e| anyhow::anyhow!("allocate pool buffer {}/{}: {:#}", index, capacity, e))?;
            empty.put(Slot { index, buf });
        }
        let ledger = (0..capacity)
            .map(|_| AtomicU8::new(SlotState::Empty as u8))
            .collect();

        log::debug!("frame pool ready, {} buffers", capacity);
        Ok(Self {
            capacity,
            empty,
            full: BoundedChannel::new(capacity),
            ledger,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn mark(&self, slot: &Slot<B>, state: SlotState) -> SlotState {
        SlotState::from_u8(self.ledger[slot.index].swap(state as u8, Ordering::AcqRel))
    }

    fn state(&self, index: usize) -> SlotState {
        SlotState::from_u8(self.ledger[index].load(Ordering::Acquire))
    }

    /// Blocks until an empty buffer is available.
    pub fn borrow_empty(&self) -> Slot<B> {
        let slot = self.empty.get();
        self.mark(&slot, SlotState::Producer);
        slot
    }

    pub fn try_borrow_empty(&self) -> Option<Slot<B>> {
        let slot = self.empty.try_get()?;
        self.mark(&slot, SlotState::Producer);
        Some(slot)
    }

    /// Hands a filled buffer downstream, blocking while the full side is at
    /// capacity.
    pub fn submit(&self, slot: Slot<B>) {
        self.mark(&slot, SlotState::Full);
        self.full.put(FrameCmd::Data(slot));
    }

    /// Non-blocking hand-off; a saturated full side gives the slot back.
    pub fn try_submit(&self, slot: Slot<B>) -> Result<(), Slot<B>> {
        let previous = self.mark(&slot, SlotState::Full);
        match self.full.try_put(FrameCmd::Data(slot)) {
            Ok(()) => Ok(()),
            Err(FrameCmd::Data(slot)) => {
                self.mark(&slot, previous);
                Err(slot)
            }
            Err(FrameCmd::EOF) => unreachable!("only data was offered"),
        }
    }

    /// Enqueues the end-of-stream marker. Always blocking so shutdown is
    /// never dropped.
    pub fn finish(&self) {
        self.full.put(FrameCmd::EOF);
    }

    /// Blocks until a filled buffer or the end-of-stream marker arrives.
    pub fn take_full(&self) -> FrameCmd<B> {
        let cmd = self.full.get();
        if let FrameCmd::Data(slot) = &cmd {
            self.mark(slot, SlotState::Consumer);
        }
        cmd
    }

    pub fn try_take_full(&self) -> Option<FrameCmd<B>> {
        let cmd = self.full.try_get()?;
        if let FrameCmd::Data(slot) = &cmd {
            self.mark(slot, SlotState::Consumer);
        }
        Some(cmd)
    }

    /// Returns a buffer to the empty side. Never blocks in practice: the
    /// empty channel has room for every buffer the pool owns.
    pub fn recycle(&self, slot: Slot<B>) {
        self.mark(&slot, SlotState::Empty);
        self.empty.put(slot);
    }

    /// Retires a checked-out buffer instead of recycling it.
    pub fn release(&self, slot: Slot<B>) -> anyhow::Result<()> {
        match self.mark(&slot, SlotState::Released) {
            SlotState::Released => anyhow::bail!("buffer {} released twice", slot.index),
            SlotState::Producer | SlotState::Consumer => Ok(()),
            state => anyhow::bail!("buffer {} released while {:?}", slot.index, state),
        }
    }

    pub fn census(&self) -> Census {
        let mut census = Census::default();
        for index in 0..self.capacity {
            match self.state(index) {
                SlotState::Empty => census.empty += 1,
                SlotState::Full => census.full += 1,
                SlotState::Producer => census.producer += 1,
                SlotState::Consumer => census.consumer += 1,
                SlotState::Released => census.released += 1,
            }
        }
        census
    }

    pub fn empty_len(&self) -> usize {
        self.empty.len()
    }

    /// Buffered items on the full side, the end-of-stream marker included.
    pub fn full_len(&self) -> usize {
        self.full.len()
    }

    /// Tears the pool down once both stages are done: drains both channels,
    /// drops any leftover end-of-stream marker and releases every buffer
    /// exactly once. Returns how many buffers this call released. Calling it
    /// again releases nothing.
    pub fn reclaim(&self) -> anyhow::Result<usize> {
        let mut released = 0;
        while let Some(cmd) = self.full.try_get() {
            if let FrameCmd::Data(slot) = cmd {
                self.mark(&slot, SlotState::Released);
                released += 1;
            }
        }
        while let Some(slot) = self.empty.try_get() {
            self.mark(&slot, SlotState::Released);
            released += 1;
        }

        let census = self.census();
        if census.checked_out() > 0 {
            anyhow::bail!(
                "{} of {} buffers still checked out at teardown",
                census.checked_out(),
                self.capacity
            );
        }
        log::debug!("frame pool reclaimed {} buffers", released);
        Ok(released)
    }
}

impl<B> Drop for FramePool<B> {
    fn drop(&mut self) {
        let census = self.census();
        if census.checked_out() > 0 {
            log::warn!(
                "frame pool dropped with {} buffers checked out",
                census.checked_out()
            );
        }
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
