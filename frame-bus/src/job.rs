//! End-to-end jobs built from the pieces of this crate.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ffmpeg_next::Rational;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::decoder::{DecoderConfig, VideoDecoder};
use crate::engine::{DecodeEngine, DecodeSource, EncodeEngine, EncodeParams};
use crate::frame::{Frame, FrameLayout};
use crate::pipeline::{Pipeline, PipelineConfig, PipelineReport};
use crate::recorder::{Mp4Recorder, RecorderConfig, RecordingReport};
use crate::segment::{CutPolicy, SegmentController, SegmentNaming, SegmentSummary};
use crate::stage::Backpressure;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub pipeline: PipelineConfig,
    pub decoder: DecoderConfig,
    pub recorder: RecorderConfig,
    pub policy: CutPolicy,
    pub naming: SegmentNaming,
    /// Stop after this many decoded frames.
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitReport {
    pub segments: SegmentSummary,
    pub pipeline: PipelineReport,
    pub fps: f64,
}

/// Decodes `input` and writes one MP4 per dark-frame-delimited segment.
pub fn split(
    input: &str,
    config: &SplitConfig,
    cancel: CancellationToken,
) -> anyhow::Result<SplitReport> {
    let mut decoder = VideoDecoder::new(config.decoder.clone());
    let info = decoder.start(input)?;
    let layout = decoder.frame_layout()?;

    std::fs::create_dir_all(&config.naming.dir).map_err(|e| {
        anyhow::anyhow!("create output dir {}: {}", config.naming.dir.display(), e)
    })?;
    let controller = SegmentController::open(
        Mp4Recorder::new(config.recorder.clone()),
        EncodeParams::from_stream(&info, PathBuf::new()),
        config.naming.clone(),
        config.policy,
    )?;

    let source = DecodeSource::new(decoder).with_limit(config.max_frames);
    let pipeline = Pipeline::start(
        &config.pipeline,
        |_| Frame::new(layout),
        source,
        controller,
        cancel,
    )?;
    let outcome = pipeline.join()?;

    Ok(SplitReport {
        segments: outcome.sink.summary(),
        pipeline: outcome.report,
        fps: info.fps(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub recorder: RecorderConfig,
    pub backpressure: Backpressure,
    pub fps: i32,
    pub interval_ms: u64,
    /// Forward-then-backward passes over the input.
    pub loops: u32,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig::default(),
            backpressure: Backpressure::Drop,
            fps: 30,
            interval_ms: 15,
            loops: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordReport {
    pub read: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub recording: RecordingReport,
}

/// Frame indices for `loops` forward-then-backward passes over `frames`
/// frames. The backward leg skips both ends.
pub fn ping_pong(frames: u64, loops: u32) -> impl Iterator<Item = u64> {
    (0..loops).flat_map(move |_| (0..frames).chain((1..frames.saturating_sub(1)).rev()))
}

/// Seekable reader over a file of back-to-back packed frames.
pub struct RawFrames {
    reader: BufReader<File>,
    frame_size: usize,
    frames: u64,
}

impl RawFrames {
    pub fn open(path: &Path, layout: FrameLayout) -> anyhow::Result<Self> {
        let frame_size = layout
            .frame_size()
            .ok_or(anyhow::anyhow!("no packed size for {:?}", layout.format))?;
        if frame_size == 0 {
            anyhow::bail!("empty frame layout {}x{}", layout.width, layout.height);
        }
        let file = File::open(path).map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
        let frames = file.metadata()?.len() / frame_size as u64;
        Ok(Self {
            reader: BufReader::new(file),
            frame_size,
            frames,
        })
    }

    /// Whole frames in the file; a trailing partial frame is ignored.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn read_at(&mut self, index: u64, frame: &mut Frame) -> anyhow::Result<()> {
        if index >= self.frames {
            anyhow::bail!("frame {} out of range, file holds {}", index, self.frames);
        }
        self.reader
            .seek(SeekFrom::Start(index * self.frame_size as u64))?;
        let size = self.frame_size;
        self.reader.read_exact(&mut frame.storage_mut()[..size])?;
        frame.set_len(size)
    }
}

/// Pushes the frames of a raw RGB24 file into an MP4 recorder at a fixed pace.
pub fn record_raw(
    input: &Path,
    layout: FrameLayout,
    output: &Path,
    config: &RecordConfig,
    cancel: CancellationToken,
) -> anyhow::Result<RecordReport> {
    let mut raw = RawFrames::open(input, layout)?;
    if raw.frames() == 0 {
        anyhow::bail!("{} holds no complete {}x{} frame", input.display(), layout.width, layout.height);
    }

    let mut recorder = Mp4Recorder::new(config.recorder.clone());
    recorder.start(&EncodeParams {
        width: layout.width,
        height: layout.height,
        frame_rate: Rational::new(config.fps, 1),
        output: output.to_path_buf(),
        backpressure: config.backpressure,
    })?;

    let interval = Duration::from_millis(config.interval_ms);
    let mut frame = Frame::new(layout)?;
    let mut report = RecordReport::default();
    for index in ping_pong(raw.frames(), config.loops) {
        if cancel.is_cancelled() {
            log::info!("record cancelled after {} frames", report.read);
            break;
        }
        raw.read_at(index, &mut frame)?;
        frame.set_timestamp(report.read as i64 * 1000 / config.fps.max(1) as i64);
        report.read += 1;
        if recorder.submit_frame(&frame)? {
            report.accepted += 1;
        } else {
            report.dropped += 1;
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    recorder.stop()?;
    report.recording = recorder.last_report().unwrap_or_default();
    log::info!(
        "record finished, read: {}, accepted: {}, dropped: {}",
        report.read,
        report.accepted,
        report.dropped
    );
    Ok(report)
}

#[cfg(test)]
#[path = "job_test.rs"]
mod job_test;
