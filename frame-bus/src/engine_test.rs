use std::collections::VecDeque;
use std::path::PathBuf;

use ffmpeg_next::Rational;

use super::{DecodeEngine, DecodeSource, EncodeParams, StreamInfo};
use crate::frame::{Frame, FrameLayout};
use crate::stage::{Backpressure, Fill, FrameSource};

/// Plays back a fixed script; `None` entries are zero-length frames.
struct Scripted {
    script: VecDeque<Option<u8>>,
}

impl Scripted {
    fn new(script: &[Option<u8>]) -> Self {
        Self {
            script: script.iter().copied().collect(),
        }
    }
}

impl DecodeEngine for Scripted {
    fn start(&mut self, _source: &str) -> anyhow::Result<StreamInfo> {
        Ok(StreamInfo {
            width: 2,
            height: 1,
            frame_rate: Rational::new(30000, 1001),
        })
    }

    fn frame_layout(&self) -> anyhow::Result<FrameLayout> {
        Ok(FrameLayout::rgb24(2, 1))
    }

    fn read_frame(&mut self, frame: &mut Frame) -> anyhow::Result<bool> {
        match self.script.pop_front() {
            Some(Some(value)) => {
                frame.fill_from(&[value; 6])?;
                Ok(true)
            }
            Some(None) => {
                frame.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[test]
fn test_decode_source_maps_reads_to_fills() -> anyhow::Result<()> {
    let mut source = DecodeSource::new(Scripted::new(&[Some(1), None, Some(2)]));
    let mut frame = Frame::new(FrameLayout::rgb24(2, 1))?;

    assert_eq!(source.fill(&mut frame)?, Fill::Filled);
    assert_eq!(frame.data(), &[1; 6]);
    assert_eq!(source.fill(&mut frame)?, Fill::Pending);
    assert_eq!(source.fill(&mut frame)?, Fill::Filled);
    assert_eq!(frame.data(), &[2; 6]);
    assert_eq!(source.fill(&mut frame)?, Fill::End);
    assert_eq!(source.produced(), 2);
    Ok(())
}

#[test]
fn test_decode_source_honours_limit() -> anyhow::Result<()> {
    let script = [Some(1), Some(2), Some(3), Some(4)];
    let mut source = DecodeSource::new(Scripted::new(&script)).with_limit(Some(2));
    let mut frame = Frame::new(FrameLayout::rgb24(2, 1))?;

    assert_eq!(source.fill(&mut frame)?, Fill::Filled);
    assert_eq!(source.discard()?, Fill::Filled);
    assert_eq!(source.fill(&mut frame)?, Fill::End);
    assert_eq!(source.into_inner().script.len(), 2);
    Ok(())
}

#[test]
fn test_decode_source_discard_reaches_end() -> anyhow::Result<()> {
    let mut source = DecodeSource::new(Scripted::new(&[Some(9)]));
    assert_eq!(source.discard()?, Fill::Filled);
    assert_eq!(source.discard()?, Fill::End);
    Ok(())
}

#[test]
fn test_stream_info_fps() {
    let info = StreamInfo {
        width: 1,
        height: 1,
        frame_rate: Rational::new(30000, 1001),
    };
    assert!((info.fps() - 29.97).abs() < 0.01);
    let unknown = StreamInfo {
        frame_rate: Rational::new(0, 0),
        ..info
    };
    assert_eq!(unknown.fps(), 0.0);
}

#[test]
fn test_encode_params_keep_geometry_across_outputs() {
    let info = StreamInfo {
        width: 640,
        height: 360,
        frame_rate: Rational::new(25, 1),
    };
    let first = EncodeParams::from_stream(&info, PathBuf::from("a.mp4"));
    let second = first.with_output(PathBuf::from("b.mp4"));
    assert_eq!(first.backpressure, Backpressure::Block);
    assert_eq!((second.width, second.height), (640, 360));
    assert_eq!(second.frame_rate, info.frame_rate);
    assert_eq!(second.output, PathBuf::from("b.mp4"));
}
