//! Dark-frame segmentation.
//!
//! The controller watches frames coming out of a pool and decides, frame by
//! frame, whether the current output segment should be closed and the next
//! one opened. A cut needs both a minimum run length and a darkness spike:
//!
//! ```text
//!            frame_count > min_frames_before_cut
//!            && darkness > dark_threshold
//! ACCUMULATING ─────────────────────────────────► TRANSITIONING
//!      ▲                                               │
//!      └──── stop engine, index += 1, start engine ────┘
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{EncodeEngine, EncodeParams};
use crate::frame::Frame;
use crate::stage::FrameSink;

/// `1 - mean(sample) / 255`: 0.0 for full white, 1.0 for full black.
/// An empty frame scores 0.0 so it can never trigger a cut.
pub fn darkness(samples: &[u8]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|&s| s as u64).sum();
    1.0 - sum as f64 / (255.0 * samples.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CutPolicy {
    pub dark_threshold: f64,
    pub min_frames_before_cut: u64,
}

impl Default for CutPolicy {
    fn default() -> Self {
        Self {
            dark_threshold: 0.99,
            min_frames_before_cut: 150,
        }
    }
}

impl CutPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.dark_threshold) {
            anyhow::bail!("dark_threshold {} outside [0, 1]", self.dark_threshold);
        }
        Ok(())
    }
}

/// Maps a segment index to its output path, `<dir>/<prefix><index>.<extension>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentNaming {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
}

impl Default for SegmentNaming {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: "output_".to_string(),
            extension: "mp4".to_string(),
        }
    }
}

impl SegmentNaming {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn target(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", self.prefix, index, self.extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accumulating,
    /// Old segment closed, new one not open yet. Only observable if opening
    /// the next segment failed.
    Transitioning,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    Cut { index: u64, target: PathBuf },
}

/// Counters the controller mutates on its own thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentState {
    pub frame_count: u64,
    pub index: u64,
    pub target: PathBuf,
    pub phase: Phase,
}

impl SegmentState {
    pub fn new(naming: &SegmentNaming) -> Self {
        Self {
            frame_count: 0,
            index: 0,
            target: naming.target(0),
            phase: Phase::Accumulating,
        }
    }

    /// Counts one frame and reports whether it should start a new segment.
    pub fn should_cut(&mut self, score: f64, policy: &CutPolicy) -> bool {
        self.frame_count += 1;
        self.frame_count > policy.min_frames_before_cut && score > policy.dark_threshold
    }

    fn advance(&mut self, naming: &SegmentNaming) {
        self.frame_count = 0;
        self.index += 1;
        self.target = naming.target(self.index);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSummary {
    pub segments: u64,
    pub frames: u64,
    pub rejected: u64,
}

pub struct SegmentController<E> {
    engine: E,
    params: EncodeParams,
    naming: SegmentNaming,
    policy: CutPolicy,
    state: SegmentState,
    frames: u64,
    rejected: u64,
}

impl<E: EncodeEngine> SegmentController<E> {
    /// Opens segment 0 right away so a bad output target fails before any
    /// frame is pulled.
    pub fn open(
        mut engine: E,
        params: EncodeParams,
        naming: SegmentNaming,
        policy: CutPolicy,
    ) -> anyhow::Result<Self> {
        policy.validate()?;
        let state = SegmentState::new(&naming);
        let params = params.with_output(state.target.clone());
        engine
            .start(&params)
            .map_err(|e| anyhow::anyhow!("open segment {}: {:#}", state.target.display(), e))?;
        log::info!("segment 0 opened: {}", state.target.display());

        Ok(Self {
            engine,
            params,
            naming,
            policy,
            state,
            frames: 0,
            rejected: 0,
        })
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            segments: self.state.index + 1,
            frames: self.frames,
            rejected: self.rejected,
        }
    }

    /// Feeds one darkness score through the state machine, cutting if due.
    pub fn observe(&mut self, score: f64) -> anyhow::Result<Decision> {
        if self.state.phase == Phase::Transitioning {
            anyhow::bail!("segment {} never opened", self.state.index);
        }
        if !self.state.should_cut(score, &self.policy) {
            return Ok(Decision::Continue);
        }

        self.state.phase = Phase::Transitioning;
        self.engine.stop()?;
        self.state.advance(&self.naming);
        self.params = self.params.with_output(self.state.target.clone());
        self.engine
            .start(&self.params)
            .map_err(|e| anyhow::anyhow!("open segment {}: {:#}", self.state.target.display(), e))?;
        self.state.phase = Phase::Accumulating;

        Ok(Decision::Cut {
            index: self.state.index,
            target: self.state.target.clone(),
        })
    }

    /// Scores the frame, cuts if due, then hands it to the current segment.
    /// The frame that triggers a cut opens the new segment.
    pub fn process(&mut self, frame: &Frame) -> anyhow::Result<Decision> {
        let score = darkness(frame.data());
        let decision = self.observe(score)?;
        if let Decision::Cut { target, .. } = &decision {
            log::info!(
                "timestamp: {}, len: {}, darkness: {:.4}, new file: {}",
                frame.timestamp(),
                frame.len(),
                score,
                target.display()
            );
        }

        if self.engine.submit_frame(frame)? {
            self.frames += 1;
        } else {
            self.rejected += 1;
        }
        Ok(decision)
    }

    /// Closes the open segment.
    pub fn finish(&mut self) -> anyhow::Result<SegmentSummary> {
        if self.engine.is_running() {
            self.engine.stop()?;
        }
        let summary = self.summary();
        log::info!(
            "segmentation finished, segments: {}, frames: {}, rejected: {}",
            summary.segments,
            summary.frames,
            summary.rejected
        );
        Ok(summary)
    }
}

impl<E: EncodeEngine> FrameSink<Frame> for SegmentController<E> {
    fn consume(&mut self, frame: &mut Frame) -> anyhow::Result<()> {
        self.process(frame).map(|_| ())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.finish().map(|_| ())
    }
}

#[cfg(test)]
#[path = "segment_test.rs"]
mod segment_test;
