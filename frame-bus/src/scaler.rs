use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;
use ffmpeg_next::software::scaling::{Context, flag::Flags};

use crate::frame::Frame;

/// Pixel-format and size conversion between two fixed geometries.
pub struct Scaler {
    context: Context,
}

impl Scaler {
    pub fn new(
        src_format: Pixel,
        src_width: u32,
        src_height: u32,
        dst_format: Pixel,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<Self> {
        let context = Context::get(
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            Flags::BILINEAR,
        )
        .map_err(|e| {
            anyhow::anyhow!(
                "scaler {:?} {}x{} -> {:?} {}x{}: {}",
                src_format,
                src_width,
                src_height,
                dst_format,
                dst_width,
                dst_height,
                e
            )
        })?;
        Ok(Self { context })
    }

    /// Same size, different format.
    pub fn convert(src_format: Pixel, dst_format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        Self::new(src_format, width, height, dst_format, width, height)
    }

    pub fn input_format(&self) -> Pixel {
        self.context.input().format
    }

    pub fn output_format(&self) -> Pixel {
        self.context.output().format
    }

    pub fn run(&mut self, frame: &Video, dst: &mut Video) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

/// Copies a packed single-plane image into plane 0 of `dst`, honouring the
/// plane stride. `row` is the packed row size in bytes.
pub fn copy_into_plane(src: &[u8], row: usize, dst: &mut Video) -> anyhow::Result<()> {
    let height = dst.height() as usize;
    if row == 0 || src.len() < row * height {
        anyhow::bail!(
            "packed image of {} bytes too small for {} rows of {}",
            src.len(),
            height,
            row
        );
    }
    let stride = dst.stride(0);
    if stride < row {
        anyhow::bail!("plane stride {} smaller than row {}", stride, row);
    }
    let plane = dst.data_mut(0);
    for (y, line) in src.chunks_exact(row).take(height).enumerate() {
        plane[y * stride..y * stride + row].copy_from_slice(line);
    }
    Ok(())
}

/// Packs plane 0 of `src` into `dst` and sets its length.
pub fn copy_from_plane(src: &Video, row: usize, dst: &mut Frame) -> anyhow::Result<()> {
    let height = src.height() as usize;
    let size = row * height;
    if size > dst.capacity() {
        anyhow::bail!("{} byte picture does not fit frame capacity {}", size, dst.capacity());
    }
    let stride = src.stride(0);
    if stride < row {
        anyhow::bail!("plane stride {} smaller than row {}", stride, row);
    }
    let plane = src.data(0);
    let storage = dst.storage_mut();
    for y in 0..height {
        storage[y * row..(y + 1) * row].copy_from_slice(&plane[y * stride..y * stride + row]);
    }
    dst.set_len(size)?;
    dst.set_format(src.format());
    Ok(())
}

#[cfg(test)]
#[path = "scaler_test.rs"]
mod scaler_test;
