//! Demux and decode of the best video stream of a file or URL.
//!
//! Decoding runs on its own source-stage thread and fills a small pool of
//! decoder frames under the blocking discipline. `read_frame` takes from that
//! pool on the caller's thread and converts to packed RGB24.

use std::sync::Arc;
use std::time::Duration;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use ffmpeg_next::{Rational, codec, media};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{DecodeEngine, StreamInfo};
use crate::frame::{Frame, FrameCmd, FrameLayout, pts_ms};
use crate::pool::FramePool;
use crate::scaler::{Scaler, copy_from_plane};
use crate::stage::{Backpressure, Fill, FrameSource, SourceStage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decoded frames buffered ahead of `read_frame`.
    pub buffer_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { buffer_size: 10 }
    }
}

/// Owns the demuxer and the codec; lives on the decode thread.
struct PacketDecoder {
    input: ffmpeg_next::format::context::Input,
    decoder: codec::decoder::Video,
    stream_index: usize,
    eof_sent: bool,
}

unsafe impl Send for PacketDecoder {}

impl PacketDecoder {
    /// Reads packets until one of ours reaches the codec, or input ends.
    fn feed(&mut self) -> anyhow::Result<()> {
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    match self.decoder.send_packet(&packet) {
                        Ok(()) => return Ok(()),
                        Err(ffmpeg_next::Error::InvalidData) => {
                            log::debug!("decoder skipped corrupt packet");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl FrameSource<Video> for PacketDecoder {
    fn fill(&mut self, frame: &mut Video) -> anyhow::Result<Fill> {
        loop {
            match self.decoder.receive_frame(frame) {
                Ok(()) => return Ok(Fill::Filled),
                Err(ffmpeg_next::Error::Eof) => return Ok(Fill::End),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    if self.eof_sent {
                        return Ok(Fill::End);
                    }
                }
                Err(e) => return Err(e.into()),
            }
            self.feed()?;
        }
    }
}

struct Running {
    info: StreamInfo,
    time_base: Rational,
    pool: Arc<FramePool<Video>>,
    stage: Option<SourceStage<PacketDecoder>>,
    cancel: CancellationToken,
    scaler: Option<Scaler>,
    staging: Video,
    finished: bool,
}

impl Running {
    fn join_stage(&mut self) -> anyhow::Result<()> {
        if let Some(stage) = self.stage.take() {
            let (_, report) = stage.join()?;
            log::info!(
                "decoder finished, frames: {}, pauses: {}",
                report.frames,
                report.pauses
            );
        }
        Ok(())
    }
}

pub struct VideoDecoder {
    config: DecoderConfig,
    running: Option<Running>,
}

impl VideoDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn info(&self) -> Option<StreamInfo> {
        self.running.as_ref().map(|r| r.info)
    }

    fn open(source: &str) -> anyhow::Result<(PacketDecoder, StreamInfo, Rational)> {
        let input = ffmpeg_next::format::input(&source)
            .map_err(|e| anyhow::anyhow!("open input {}: {}", source, e))?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or(anyhow::anyhow!("no video stream in {}", source))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let mut frame_rate = stream.avg_frame_rate();
        if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
            frame_rate = stream.rate();
        }

        let mut decoder_ctx = codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = time_base.into();
        }
        decoder_ctx.set_parameters(stream.parameters())?;
        let decoder = decoder_ctx.decoder().video()?;
        if decoder.format() == Pixel::None || decoder.width() == 0 || decoder.height() == 0 {
            anyhow::bail!("missing codec parameters in {}", source);
        }

        let info = StreamInfo {
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
        };
        Ok((
            PacketDecoder {
                input,
                decoder,
                stream_index,
                eof_sent: false,
            },
            info,
            time_base,
        ))
    }

    /// Cancels the decode thread, drains what it already produced, joins it
    /// and returns every buffer to the pool.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        if !running.finished {
            loop {
                match running.pool.take_full() {
                    FrameCmd::Data(slot) => running.pool.recycle(slot),
                    FrameCmd::EOF => break,
                }
            }
        }
        running.join_stage()?;
        let reclaimed = running.pool.reclaim()?;
        log::info!("decoder stopped, reclaimed: {}", reclaimed);
        Ok(())
    }
}

impl DecodeEngine for VideoDecoder {
    fn start(&mut self, source: &str) -> anyhow::Result<StreamInfo> {
        if self.running.is_some() {
            anyhow::bail!("decoder already started");
        }
        let (decoder, info, time_base) = Self::open(source)?;
        let pool = Arc::new(FramePool::new(self.config.buffer_size, |_| {
            Ok(Video::empty())
        })?);
        let cancel = CancellationToken::new();
        let stage = SourceStage::spawn(
            "decoder",
            pool.clone(),
            decoder,
            Backpressure::Block,
            Duration::from_millis(5),
            cancel.clone(),
        )?;
        log::info!(
            "decoder started: {}, {}x{}, fps: {:.2}",
            source,
            info.width,
            info.height,
            info.fps()
        );

        self.running = Some(Running {
            info,
            time_base,
            pool,
            stage: Some(stage),
            cancel,
            scaler: None,
            staging: Video::new(Pixel::RGB24, info.width, info.height),
            finished: false,
        });
        Ok(info)
    }

    fn frame_layout(&self) -> anyhow::Result<FrameLayout> {
        let info = self.info().ok_or(anyhow::anyhow!("decoder not started"))?;
        Ok(FrameLayout::rgb24(info.width, info.height))
    }

    fn read_frame(&mut self, frame: &mut Frame) -> anyhow::Result<bool> {
        let running = self
            .running
            .as_mut()
            .ok_or(anyhow::anyhow!("decoder not started"))?;
        if running.finished {
            return Ok(false);
        }

        let slot = match running.pool.take_full() {
            FrameCmd::Data(slot) => slot,
            FrameCmd::EOF => {
                running.finished = true;
                // a decode failure also ends the stream, surface it here
                running.join_stage()?;
                return Ok(false);
            }
        };

        let info = running.info;
        let (width, height) = (slot.width(), slot.height());
        if width != info.width || height != info.height {
            running.pool.recycle(slot);
            anyhow::bail!("picture size changed mid-stream to {}x{}", width, height);
        }
        if running.scaler.is_none() {
            running.scaler = Some(Scaler::convert(
                slot.format(),
                Pixel::RGB24,
                info.width,
                info.height,
            )?);
        }

        let converted = match running.scaler.as_mut() {
            Some(scaler) => scaler.run(&slot, &mut running.staging),
            None => Err(anyhow::anyhow!("scaler missing")),
        };
        let pts = slot.timestamp().or(slot.pts()).unwrap_or(0);
        running.pool.recycle(slot);
        converted?;

        copy_from_plane(&running.staging, info.width as usize * 3, frame)?;
        frame.set_timestamp(pts_ms(pts, running.time_base));
        Ok(true)
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("decoder stop: {:#}", e);
        }
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
