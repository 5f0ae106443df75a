use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "segcut", version, about = "Split videos at dark frames, record raw frames to MP4")]
pub struct Cli {
    /// JSON settings file; command-line values win over it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Try a hardware H.264 encoder before the software one.
    #[arg(long, global = true)]
    pub hardware: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode a video and write one MP4 per dark-frame-delimited segment.
    Split(SplitArgs),
    /// Encode a file of packed RGB24 frames into an MP4.
    Record(RecordArgs),
}

#[derive(Debug, Args)]
pub struct SplitArgs {
    pub input: String,
    pub output_dir: PathBuf,
    /// Frames buffered between decoder and recorder.
    pub pool_size: Option<usize>,
    #[arg(long)]
    pub max_frames: Option<u64>,
    /// Darkness above which a frame may start a new segment.
    #[arg(long)]
    pub threshold: Option<f64>,
    /// Frames a segment must hold before it can be cut.
    #[arg(long)]
    pub min_frames: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    pub input: PathBuf,
    pub width: u32,
    pub height: u32,
    pub output: PathBuf,
    /// Pause between two submitted frames.
    #[arg(long)]
    pub interval_ms: Option<u64>,
    /// Forward-then-backward passes over the input.
    #[arg(long)]
    pub loops: Option<u32>,
    #[arg(long)]
    pub fps: Option<i32>,
    /// Stall instead of dropping frames when the recorder falls behind.
    #[arg(long)]
    pub block: bool,
}
