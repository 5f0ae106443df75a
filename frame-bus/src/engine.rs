//! Contracts with the media engines that sit at either end of a pipeline.

use std::path::PathBuf;

use ffmpeg_next::Rational;

use crate::frame::{Frame, FrameLayout};
use crate::stage::{Backpressure, Fill, FrameSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

impl StreamInfo {
    pub fn fps(&self) -> f64 {
        if self.frame_rate.denominator() == 0 {
            return 0.0;
        }
        self.frame_rate.numerator() as f64 / self.frame_rate.denominator() as f64
    }
}

pub trait DecodeEngine: Send {
    fn start(&mut self, source: &str) -> anyhow::Result<StreamInfo>;

    /// Layout of the frames `read_frame` produces. Only valid after `start`.
    fn frame_layout(&self) -> anyhow::Result<FrameLayout>;

    /// A buffer sized for `read_frame`.
    fn alloc_frame(&self) -> anyhow::Result<Frame> {
        Frame::new(self.frame_layout()?)
    }

    /// Fills `frame` with the next picture and its millisecond timestamp.
    /// `Ok(false)` signals end of stream.
    fn read_frame(&mut self, frame: &mut Frame) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub output: PathBuf,
    /// Discipline for `submit_frame` when the engine's own queue is full.
    pub backpressure: Backpressure,
}

impl EncodeParams {
    pub fn from_stream(info: &StreamInfo, output: PathBuf) -> Self {
        Self {
            width: info.width,
            height: info.height,
            frame_rate: info.frame_rate,
            output,
            backpressure: Backpressure::Block,
        }
    }

    pub fn with_output(&self, output: PathBuf) -> Self {
        Self {
            output,
            ..self.clone()
        }
    }
}

pub trait EncodeEngine: Send {
    fn start(&mut self, params: &EncodeParams) -> anyhow::Result<()>;

    /// `Ok(false)` when the frame was rejected under `Backpressure::Drop`.
    fn submit_frame(&mut self, frame: &Frame) -> anyhow::Result<bool>;

    /// Flushes pending frames and finalizes the container.
    fn stop(&mut self) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;
}

/// Adapts a started `DecodeEngine` into a pipeline source. Zero-length
/// frames count as an upstream pause.
pub struct DecodeSource<D> {
    decoder: D,
    limit: Option<u64>,
    produced: u64,
    scratch: Option<Frame>,
}

impl<D> DecodeSource<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            limit: None,
            produced: 0,
            scratch: None,
        }
    }

    /// Ends the stream after `limit` frames.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn into_inner(self) -> D {
        self.decoder
    }
}

impl<D: DecodeEngine> FrameSource<Frame> for DecodeSource<D> {
    fn fill(&mut self, frame: &mut Frame) -> anyhow::Result<Fill> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(Fill::End);
        }
        if !self.decoder.read_frame(frame)? {
            return Ok(Fill::End);
        }
        if frame.is_empty() {
            return Ok(Fill::Pending);
        }
        self.produced += 1;
        Ok(Fill::Filled)
    }

    fn discard(&mut self) -> anyhow::Result<Fill> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(Fill::End);
        }
        if self.scratch.is_none() {
            self.scratch = Some(self.decoder.alloc_frame()?);
        }
        if let Some(scratch) = self.scratch.as_mut() {
            if !self.decoder.read_frame(scratch)? {
                return Ok(Fill::End);
            }
        }
        self.produced += 1;
        Ok(Fill::Filled)
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
