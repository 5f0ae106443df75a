//! H.264-in-MP4 recording.
//!
//! `submit_frame` runs on the caller's thread: it converts the packed RGB24
//! picture into a pooled encoder frame and hands it off under the configured
//! discipline. Encoding and muxing run on a sink-stage thread that drains the
//! pool until `stop` sends the end-of-stream marker.

use std::path::PathBuf;
use std::sync::Arc;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use ffmpeg_next::{Dictionary, Rational, codec};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{EncodeEngine, EncodeParams};
use crate::frame::{Frame, FrameLayout};
use crate::hw::{encoder_pixel_format, find_hw_encoder};
use crate::pool::FramePool;
use crate::scaler::{Scaler, copy_into_plane};
use crate::stage::{FrameSink, FrameWriter, SinkStage, StageReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Encoder frames buffered between `submit_frame` and the encode thread.
    pub buffer_size: usize,
    /// Encoder name, e.g. `libx264`. Any H.264 encoder when unset.
    pub codec: Option<String>,
    pub threads: usize,
    /// Try a hardware encoder first and fall back to software.
    pub hardware: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            codec: None,
            threads: 4,
            hardware: false,
        }
    }
}

/// Muxer plus encoder; lives on the encode thread.
struct EncodeSink {
    output: ffmpeg_next::format::context::Output,
    encoder: codec::encoder::Video,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    frame_index: i64,
    packets: u64,
}

unsafe impl Send for EncodeSink {}

impl EncodeSink {
    fn open(params: &EncodeParams, config: &RecorderConfig) -> anyhow::Result<(Self, Pixel)> {
        if params.frame_rate.numerator() <= 0 || params.frame_rate.denominator() <= 0 {
            anyhow::bail!("invalid frame rate {}", params.frame_rate);
        }
        let mut output = ffmpeg_next::format::output_as(&params.output, "mp4")
            .map_err(|e| anyhow::anyhow!("open output {}: {}", params.output.display(), e))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let (encoder, codec_name, pixel_format) = open_encoder(params, config, global_header)?;

        let stream_index = {
            let mut ost = output.add_stream(ffmpeg_next::encoder::find(codec::Id::H264))?;
            ost.set_parameters(&encoder);
            ost.set_time_base(params.frame_rate.invert());
            ost.index()
        };
        output.write_header()?;
        let stream_time_base = output
            .stream(stream_index)
            .ok_or(anyhow::anyhow!("output stream {} missing", stream_index))?
            .time_base();
        let encoder_time_base: Rational = unsafe { (*encoder.0.as_ptr()).time_base.into() };

        log::info!(
            "recorder opened {}, encoder: {}, {}x{}@{}",
            params.output.display(),
            codec_name,
            params.width,
            params.height,
            params.frame_rate
        );
        Ok((
            Self {
                output,
                encoder,
                stream_index,
                encoder_time_base,
                stream_time_base,
                frame_index: 0,
                packets: 0,
            },
            pixel_format,
        ))
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.set_stream(self.stream_index);
                    packet.set_position(-1);
                    packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
                    packet.write_interleaved(&mut self.output)?;
                    self.packets += 1;
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl FrameSink<Video> for EncodeSink {
    fn consume(&mut self, frame: &mut Video) -> anyhow::Result<()> {
        frame.set_pts(Some(self.frame_index));
        self.frame_index += 1;
        self.encoder.send_frame(frame)?;
        self.drain()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.drain()?;
        self.output.write_trailer()?;
        log::info!(
            "recorder flushed, frames: {}, packets: {}",
            self.frame_index,
            self.packets
        );
        Ok(())
    }
}

fn software_codec(config: &RecorderConfig) -> anyhow::Result<ffmpeg_next::Codec> {
    match config.codec.as_deref() {
        Some(name) => ffmpeg_next::encoder::find_by_name(name)
            .ok_or(anyhow::anyhow!("codec not found: {}", name)),
        None => ffmpeg_next::encoder::find(codec::Id::H264)
            .ok_or(anyhow::anyhow!("no H.264 encoder available")),
    }
}

fn configure_and_open(
    codec: ffmpeg_next::Codec,
    params: &EncodeParams,
    config: &RecorderConfig,
    global_header: bool,
) -> anyhow::Result<(codec::encoder::Video, Pixel)> {
    let pixel_format = encoder_pixel_format(codec.name());
    let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
    encoder.set_width(params.width);
    encoder.set_height(params.height);
    encoder.set_format(pixel_format);
    encoder.set_frame_rate(Some(params.frame_rate));
    encoder.set_time_base(params.frame_rate.invert());
    if global_header {
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    let mut opts = Dictionary::new();
    opts.set("threads", &config.threads.to_string());
    if codec.name() == "libx264" {
        opts.set("preset", "veryfast");
    }
    let encoder = encoder.open_with(opts)?;
    Ok((encoder, pixel_format))
}

/// Opens the configured encoder, trying a hardware variant first when asked.
fn open_encoder(
    params: &EncodeParams,
    config: &RecorderConfig,
    global_header: bool,
) -> anyhow::Result<(codec::encoder::Video, String, Pixel)> {
    let software = software_codec(config)?;
    if config.hardware {
        if let Some(hw_codec) = find_hw_encoder(software.name()) {
            match configure_and_open(hw_codec, params, config, global_header) {
                Ok((encoder, pixel_format)) => {
                    return Ok((encoder, hw_codec.name().to_string(), pixel_format));
                }
                Err(e) => log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    hw_codec.name(),
                    e,
                    software.name()
                ),
            }
        } else {
            log::info!("no hardware encoder found, using software encoder: {}", software.name());
        }
    }
    let (encoder, pixel_format) = configure_and_open(software, params, config, global_header)?;
    Ok((encoder, software.name().to_string(), pixel_format))
}

struct Running {
    output: PathBuf,
    layout: FrameLayout,
    pool: Arc<FramePool<Video>>,
    writer: FrameWriter<Video>,
    sink: SinkStage<EncodeSink>,
    failed: CancellationToken,
    scaler: Scaler,
    staging: Video,
}

/// Summary of one finished recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingReport {
    pub submitted: StageReport,
    pub encoded: StageReport,
}

pub struct Mp4Recorder {
    config: RecorderConfig,
    running: Option<Running>,
    last: Option<RecordingReport>,
}

impl Mp4Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            running: None,
            last: None,
        }
    }

    /// Counters of the last recording `stop` finished.
    pub fn last_report(&self) -> Option<RecordingReport> {
        self.last
    }
}

impl EncodeEngine for Mp4Recorder {
    fn start(&mut self, params: &EncodeParams) -> anyhow::Result<()> {
        if self.running.is_some() {
            anyhow::bail!("recorder already running");
        }
        let (sink, pixel_format) = EncodeSink::open(params, &self.config)?;
        let (width, height) = (params.width, params.height);
        let pool = Arc::new(FramePool::new(self.config.buffer_size, |_| {
            Ok(Video::new(pixel_format, width, height))
        })?);
        let failed = CancellationToken::new();
        let scaler = Scaler::convert(Pixel::RGB24, pixel_format, width, height)?;
        let sink = SinkStage::spawn("recorder", pool.clone(), sink, failed.clone())?;

        self.running = Some(Running {
            output: params.output.clone(),
            layout: FrameLayout::rgb24(width, height),
            writer: FrameWriter::new(pool.clone(), params.backpressure),
            pool,
            sink,
            failed,
            scaler,
            staging: Video::new(Pixel::RGB24, width, height),
        });
        Ok(())
    }

    fn submit_frame(&mut self, frame: &Frame) -> anyhow::Result<bool> {
        let Some(running) = self.running.as_mut() else {
            anyhow::bail!("recorder not running");
        };
        if running.failed.is_cancelled() {
            anyhow::bail!("recorder for {} failed", running.output.display());
        }
        let Running {
            layout,
            writer,
            scaler,
            staging,
            ..
        } = running;

        let expected = layout.frame_size().unwrap_or(0);
        if frame.len() != expected {
            anyhow::bail!("frame of {} bytes, expected {}", frame.len(), expected);
        }
        copy_into_plane(frame.data(), layout.width as usize * 3, staging)?;

        writer.write(|slot| {
            // the encoder may still hold a reference to this buffer
            let ret = unsafe { ffmpeg_next::ffi::av_frame_make_writable(slot.as_mut_ptr()) };
            if ret < 0 {
                anyhow::bail!("make encoder frame writable: {}", ffmpeg_next::Error::from(ret));
            }
            scaler.run(staging, slot)
        })
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.writer.close();
        let submitted = running.writer.report();
        let (_, encoded) = running.sink.join()?;
        running.pool.reclaim()?;
        log::info!(
            "recorder closed {}, frames: {}, dropped: {}",
            running.output.display(),
            encoded.frames,
            submitted.dropped
        );
        self.last = Some(RecordingReport { submitted, encoded });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for Mp4Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("recorder stop: {:#}", e);
        }
    }
}

#[cfg(test)]
#[path = "recorder_test.rs"]
mod recorder_test;
