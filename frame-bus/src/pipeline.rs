//! One producer thread and one consumer thread joined by exactly one pool.
//!
//! ```text
//! FrameSource ─► SourceStage ─► FramePool ─► SinkStage ─► FrameSink
//!                    ▲            (N buffers)    │
//!                    └──── CancellationToken ────┘
//! ```
//!
//! Start-up fails before any thread exists if the pool cannot be allocated.
//! Shutdown is cooperative: the source pushes the end-of-stream marker, the
//! sink flushes and exits, and `join` reclaims all buffers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::pool::FramePool;
use crate::stage::{Backpressure, FrameSink, FrameSource, SinkStage, SourceStage, StageReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub pool_size: usize,
    pub backpressure: Backpressure,
    pub pause_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            pool_size: 80,
            backpressure: Backpressure::Block,
            pause_backoff_ms: 5,
        }
    }
}

impl PipelineConfig {
    pub fn pause_backoff(&self) -> Duration {
        Duration::from_millis(self.pause_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub source: StageReport,
    pub sink: StageReport,
    pub reclaimed: usize,
}

/// What `join` hands back on success: both stage ends plus their counters.
pub struct PipelineOutcome<S, K> {
    pub source: S,
    pub sink: K,
    pub report: PipelineReport,
}

pub struct Pipeline<B, S, K> {
    name: String,
    pool: Arc<FramePool<B>>,
    source: SourceStage<S>,
    sink: SinkStage<K>,
    cancel: CancellationToken,
}

impl<B, S, K> Pipeline<B, S, K>
where
    B: Send + 'static,
    S: FrameSource<B> + 'static,
    K: FrameSink<B> + 'static,
{
    pub fn start<F>(
        config: &PipelineConfig,
        alloc: F,
        source: S,
        sink: K,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self>
    where
        F: FnMut(usize) -> anyhow::Result<B>,
    {
        let pool = Arc::new(FramePool::new(config.pool_size, alloc)?);

        let sink = SinkStage::spawn(
            &format!("{}-sink", config.name),
            pool.clone(),
            sink,
            cancel.clone(),
        )?;
        let source = match SourceStage::spawn(
            &format!("{}-source", config.name),
            pool.clone(),
            source,
            config.backpressure,
            config.pause_backoff(),
            cancel.clone(),
        ) {
            Ok(source) => source,
            Err(e) => {
                // no producer will ever send the marker, do it here
                pool.finish();
                if let Err(sink_err) = sink.join() {
                    log::error!("{} sink during aborted start: {:#}", config.name, sink_err);
                }
                return Err(e);
            }
        };

        log::info!(
            "{} started, pool: {}, backpressure: {:?}",
            config.name,
            config.pool_size,
            config.backpressure
        );
        Ok(Self {
            name: config.name.clone(),
            pool,
            source,
            sink,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<FramePool<B>> {
        &self.pool
    }

    /// Asks the source to stop at its next frame boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.source.is_finished() && self.sink.is_finished()
    }

    /// Waits for both stages, then reclaims the pool. A failure in either
    /// stage becomes the single error of the pipeline.
    pub fn join(self) -> anyhow::Result<PipelineOutcome<S, K>> {
        let sink = self.sink.join();
        let source = self.source.join();

        let (sink, source) = match (sink, source) {
            (Ok(sink), Ok(source)) => (sink, source),
            (sink, source) => {
                if let Err(e) = self.pool.reclaim() {
                    log::error!("{} teardown after failure: {:#}", self.name, e);
                }
                return Err(match (sink, source) {
                    (Err(sink_err), Err(source_err)) => {
                        log::error!("{} source also failed: {:#}", self.name, source_err);
                        sink_err
                    }
                    (Err(e), Ok(_)) | (Ok(_), Err(e)) => e,
                    (Ok(_), Ok(_)) => unreachable!("both stages succeeded"),
                });
            }
        };
        let (sink, sink_report) = sink;
        let (source, source_report) = source;

        let reclaimed = self.pool.reclaim()?;
        log::info!(
            "{} finished, frames: {}, dropped: {}, reclaimed: {}",
            self.name,
            sink_report.frames,
            source_report.dropped,
            reclaimed
        );
        Ok(PipelineOutcome {
            source,
            sink,
            report: PipelineReport {
                source: source_report,
                sink: sink_report,
                reclaimed,
            },
        })
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
