use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::frame::FrameCmd;
use crate::pool::{FramePool, Slot};

/// Log "pool exhausted" at most every N drops so live sources don't flood the log.
const DROP_LOG_INTERVAL: u64 = 120;

/// What a producer does when the pool has no empty buffer left. Fixed per
/// pipeline at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Stall until the consumer recycles a buffer.
    #[default]
    Block,
    /// Drop the frame and keep going.
    Drop,
}

/// Outcome of one fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Filled,
    /// Nothing usable right now (e.g. zero-length frame); back off and retry.
    Pending,
    End,
}

pub trait FrameSource<B>: Send {
    fn fill(&mut self, buf: &mut B) -> anyhow::Result<Fill>;

    /// Called instead of `fill` when a frame has to be dropped under
    /// `Backpressure::Drop`. Live sources consume and throw away one unit of
    /// input here. Returns `Fill::End` once input is exhausted.
    fn discard(&mut self) -> anyhow::Result<Fill> {
        Ok(Fill::Pending)
    }
}

pub trait FrameSink<B>: Send {
    fn consume(&mut self, buf: &mut B) -> anyhow::Result<()>;

    /// Runs once after the end-of-stream marker.
    fn flush(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Frames handed on (source) or consumed (sink).
    pub frames: u64,
    /// Frames lost to backpressure.
    pub dropped: u64,
    /// Back-offs on an upstream pause.
    pub pauses: u64,
    /// Frames recycled unconsumed after a sink failure.
    pub discarded: u64,
}

fn spawn_named<T, F>(name: &str, f: F) -> anyhow::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| anyhow::anyhow!("spawn {} thread: {}", name, e))
}

/// Runs one call into user code, turning a panic into an error so the stage
/// still goes through its shutdown protocol.
fn guarded<T, F>(name: &str, f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("{} thread panicked: {}", name, message))
        }
    }
}

fn join_named<T>(name: &str, handle: JoinHandle<anyhow::Result<T>>) -> anyhow::Result<T> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("{} thread panicked", name))?
}

/// Producer side: one thread that borrows empty buffers, fills them from a
/// `FrameSource` and hands them downstream.
pub struct SourceStage<S> {
    name: String,
    handle: JoinHandle<anyhow::Result<(S, StageReport)>>,
}

impl<S> SourceStage<S> {
    pub fn spawn<B>(
        name: &str,
        pool: Arc<FramePool<B>>,
        source: S,
        backpressure: Backpressure,
        pause_backoff: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self>
    where
        B: Send + 'static,
        S: FrameSource<B> + 'static,
    {
        let stage_name = name.to_string();
        let handle = spawn_named(name, move || {
            Self::source_loop(stage_name, pool, source, backpressure, pause_backoff, cancel)
        })?;
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> anyhow::Result<(S, StageReport)> {
        join_named(&self.name, self.handle)
    }

    fn source_loop<B>(
        name: String,
        pool: Arc<FramePool<B>>,
        mut source: S,
        backpressure: Backpressure,
        pause_backoff: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<(S, StageReport)>
    where
        S: FrameSource<B>,
    {
        log::info!("{} started, backpressure: {:?}", name, backpressure);
        let mut report = StageReport::default();

        let result = loop {
            if cancel.is_cancelled() {
                log::info!("{} cancelled", name);
                break Ok(());
            }

            let mut slot = match backpressure {
                Backpressure::Block => pool.borrow_empty(),
                Backpressure::Drop => match pool.try_borrow_empty() {
                    Some(slot) => slot,
                    None => {
                        report.dropped += 1;
                        if report.dropped % DROP_LOG_INTERVAL == 1 {
                            log::debug!(
                                "{} pool exhausted, dropped {} frames (back-pressure)",
                                name,
                                report.dropped
                            );
                        }
                        match guarded(&name, || source.discard()) {
                            Ok(Fill::End) => break Ok(()),
                            Ok(Fill::Pending) => std::thread::sleep(pause_backoff),
                            Ok(Fill::Filled) => {}
                            Err(e) => break Err(e),
                        }
                        continue;
                    }
                },
            };

            match guarded(&name, || source.fill(&mut slot)) {
                Ok(Fill::Filled) => {
                    pool.submit(slot);
                    report.frames += 1;
                }
                Ok(Fill::Pending) => {
                    pool.recycle(slot);
                    report.pauses += 1;
                    std::thread::sleep(pause_backoff);
                }
                Ok(Fill::End) => {
                    pool.recycle(slot);
                    break Ok(());
                }
                Err(e) => {
                    pool.recycle(slot);
                    log::error!("{} source error: {:#}", name, e);
                    break Err(e);
                }
            }
        };

        pool.finish();
        log::info!(
            "{} finished, frames: {}, dropped: {}, pauses: {}",
            name,
            report.frames,
            report.dropped,
            report.pauses
        );
        result.map(|_| (source, report))
    }
}

/// Consumer side: one thread that drains filled buffers into a `FrameSink`
/// and recycles them, until the end-of-stream marker.
pub struct SinkStage<K> {
    name: String,
    handle: JoinHandle<anyhow::Result<(K, StageReport)>>,
}

impl<K> SinkStage<K> {
    /// A sink failure cancels `cancel` so the paired source winds down; the
    /// sink keeps recycling buffers unconsumed until the marker arrives.
    pub fn spawn<B>(
        name: &str,
        pool: Arc<FramePool<B>>,
        sink: K,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self>
    where
        B: Send + 'static,
        K: FrameSink<B> + 'static,
    {
        let stage_name = name.to_string();
        let handle = spawn_named(name, move || Self::sink_loop(stage_name, pool, sink, cancel))?;
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> anyhow::Result<(K, StageReport)> {
        join_named(&self.name, self.handle)
    }

    fn sink_loop<B>(
        name: String,
        pool: Arc<FramePool<B>>,
        mut sink: K,
        cancel: CancellationToken,
    ) -> anyhow::Result<(K, StageReport)>
    where
        K: FrameSink<B>,
    {
        log::info!("{} started", name);
        let mut report = StageReport::default();
        let mut failure: Option<anyhow::Error> = None;

        loop {
            match pool.take_full() {
                FrameCmd::Data(mut slot) => {
                    if failure.is_none() {
                        match guarded(&name, || sink.consume(&mut slot)) {
                            Ok(()) => report.frames += 1,
                            Err(e) => {
                                log::error!("{} sink error: {:#}", name, e);
                                cancel.cancel();
                                failure = Some(e);
                            }
                        }
                    } else {
                        report.discarded += 1;
                    }
                    pool.recycle(slot);
                }
                FrameCmd::EOF => break,
            }
        }

        let flushed = guarded(&name, || sink.flush());
        log::info!(
            "{} finished, frames: {}, discarded: {}",
            name,
            report.frames,
            report.discarded
        );
        match failure {
            Some(e) => {
                if let Err(flush_err) = flushed {
                    log::error!("{} flush after failure: {:#}", name, flush_err);
                }
                Err(e)
            }
            None => flushed.map(|_| (sink, report)),
        }
    }
}

/// Push-style producer handle: the calling thread is the producer and the
/// discipline is chosen once, at construction.
pub struct FrameWriter<B> {
    pool: Arc<FramePool<B>>,
    backpressure: Backpressure,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl<B> FrameWriter<B> {
    pub fn new(pool: Arc<FramePool<B>>, backpressure: Backpressure) -> Self {
        Self {
            pool,
            backpressure,
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Borrows a buffer according to the discipline, lets `fill` write into
    /// it and hands it downstream. Returns `Ok(false)` when the frame was
    /// dropped because the pool is exhausted.
    pub fn write<F>(&self, fill: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut B) -> anyhow::Result<()>,
    {
        let slot = match self.backpressure {
            Backpressure::Block => self.pool.borrow_empty(),
            Backpressure::Drop => match self.pool.try_borrow_empty() {
                Some(slot) => slot,
                None => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % DROP_LOG_INTERVAL == 1 {
                        log::warn!("buffer full, dropped {} frames, please put frames slowly", dropped);
                    }
                    return Ok(false);
                }
            },
        };
        self.fill_and_submit(slot, fill)?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn fill_and_submit<F>(&self, mut slot: Slot<B>, fill: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut B) -> anyhow::Result<()>,
    {
        if let Err(e) = fill(&mut slot) {
            self.pool.recycle(slot);
            return Err(e);
        }
        match self.backpressure {
            Backpressure::Block => self.pool.submit(slot),
            Backpressure::Drop => {
                if let Err(slot) = self.pool.try_submit(slot) {
                    // full side still holds every other buffer plus the marker
                    self.pool.recycle(slot);
                    anyhow::bail!("writer used after close");
                }
            }
        }
        Ok(())
    }

    /// Enqueues the end-of-stream marker (always blocking).
    pub fn close(&self) {
        self.pool.finish();
    }

    pub fn report(&self) -> StageReport {
        StageReport {
            frames: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;
