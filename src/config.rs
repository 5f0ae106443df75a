use std::path::Path;

use frame_bus::job::{RecordConfig, SplitConfig};
use frame_bus::stage::Backpressure;
use serde::{Deserialize, Serialize};

use crate::cli::{RecordArgs, SplitArgs};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub split: SplitConfig,
    pub record: RecordConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))
    }

    pub fn split_config(&self, args: &SplitArgs, hardware: bool) -> SplitConfig {
        let mut config = self.split.clone();
        config.naming.dir = args.output_dir.clone();
        if let Some(pool_size) = args.pool_size {
            config.pipeline.pool_size = pool_size;
        }
        if args.max_frames.is_some() {
            config.max_frames = args.max_frames;
        }
        if let Some(threshold) = args.threshold {
            config.policy.dark_threshold = threshold;
        }
        if let Some(min_frames) = args.min_frames {
            config.policy.min_frames_before_cut = min_frames;
        }
        config.recorder.hardware |= hardware;
        config
    }

    pub fn record_config(&self, args: &RecordArgs, hardware: bool) -> RecordConfig {
        let mut config = self.record.clone();
        if let Some(interval_ms) = args.interval_ms {
            config.interval_ms = interval_ms;
        }
        if let Some(loops) = args.loops {
            config.loops = loops;
        }
        if let Some(fps) = args.fps {
            config.fps = fps;
        }
        if args.block {
            config.backpressure = Backpressure::Block;
        }
        config.recorder.hardware |= hardware;
        config
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
