//! Bounded frame hand-off between a producer thread and a consumer thread,
//! plus the ffmpeg engines and the dark-frame segmenter built on it.

/// Registers FFmpeg components and quiets its own logging. Call once at
/// startup before opening inputs or outputs.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);
    Ok(())
}

pub mod channel;
pub mod decoder;
pub mod engine;
pub mod frame;
pub mod hw;
pub mod job;
pub mod pipeline;
pub mod pool;
pub mod recorder;
pub mod scaler;
pub mod segment;
pub mod stage;
