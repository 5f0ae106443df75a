use std::fmt::{Display, Formatter};

use ffmpeg_next::{Rational, format::Pixel};

use crate::pool::Slot;

/// Stream end travels through the same channel as real frames.
pub enum FrameCmd<B> {
    Data(Slot<B>),
    EOF,
}

impl<B> FrameCmd<B> {
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameCmd::EOF)
    }
}

/// Geometry of the packed frames a pipeline moves around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
}

impl FrameLayout {
    pub fn rgb24(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: Pixel::RGB24,
        }
    }

    /// Bytes in one packed frame, `None` for formats without a packed size.
    pub fn frame_size(&self) -> Option<usize> {
        let pixels = self.width as usize * self.height as usize;
        match self.format {
            Pixel::RGB24 | Pixel::BGR24 => Some(pixels * 3),
            Pixel::RGBA | Pixel::BGRA | Pixel::ARGB | Pixel::ABGR => Some(pixels * 4),
            Pixel::GRAY8 => Some(pixels),
            Pixel::YUV420P | Pixel::NV12 => Some(pixels + pixels / 2),
            _ => None,
        }
    }

    /// Bytes in one row of the first plane.
    pub fn row_size(&self) -> Option<usize> {
        let width = self.width as usize;
        match self.format {
            Pixel::RGB24 | Pixel::BGR24 => Some(width * 3),
            Pixel::RGBA | Pixel::BGRA | Pixel::ARGB | Pixel::ABGR => Some(width * 4),
            Pixel::GRAY8 | Pixel::YUV420P | Pixel::NV12 => Some(width),
            _ => None,
        }
    }
}

/// Reusable storage for one packed frame. Capacity is fixed at allocation;
/// `len` tracks how much of it the last fill produced.
pub struct Frame {
    data: Box<[u8]>,
    len: usize,
    format: Pixel,
    timestamp: i64,
}

impl Frame {
    pub fn new(layout: FrameLayout) -> anyhow::Result<Self> {
        let size = layout
            .frame_size()
            .ok_or(anyhow::anyhow!("no packed size for {:?}", layout.format))?;
        Self::with_capacity(size, layout.format)
    }

    pub fn with_capacity(capacity: usize, format: Pixel) -> anyhow::Result<Self> {
        if capacity == 0 {
            anyhow::bail!("frame capacity must be non-zero");
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|e| anyhow::anyhow!("allocate {} byte frame: {}", capacity, e))?;
        storage.resize(capacity, 0);
        Ok(Self {
            data: storage.into_boxed_slice(),
            len: 0,
            format,
            timestamp: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn format(&self) -> Pixel {
        self.format
    }

    pub fn set_format(&mut self, format: Pixel) {
        self.format = format;
    }

    /// Presentation time in milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole backing store, for writers that fill in place before `set_len`.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn set_len(&mut self, len: usize) -> anyhow::Result<()> {
        if len > self.capacity() {
            anyhow::bail!("length {} exceeds frame capacity {}", len, self.capacity());
        }
        self.len = len;
        Ok(())
    }

    /// Copies `src` in and marks it as the frame content.
    pub fn fill_from(&mut self, src: &[u8]) -> anyhow::Result<()> {
        if src.len() > self.capacity() {
            anyhow::bail!(
                "source of {} bytes does not fit frame capacity {}",
                src.len(),
                self.capacity()
            );
        }
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.timestamp = 0;
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame len: {}, capacity: {}, format: {:?}, timestamp: {}",
            self.len,
            self.capacity(),
            self.format,
            self.timestamp
        )
    }
}

/// Converts a pts in `time_base` units to milliseconds.
pub fn pts_ms(pts: i64, time_base: Rational) -> i64 {
    if time_base.denominator() == 0 {
        return 0;
    }
    pts * 1000 * time_base.numerator() as i64 / time_base.denominator() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        let rgb = FrameLayout::rgb24(640, 360);
        assert_eq!(rgb.frame_size(), Some(640 * 360 * 3));
        assert_eq!(rgb.row_size(), Some(1920));
        let yuv = FrameLayout {
            format: Pixel::YUV420P,
            ..rgb
        };
        assert_eq!(yuv.frame_size(), Some(640 * 360 * 3 / 2));
        let odd = FrameLayout {
            format: Pixel::YUV444P16LE,
            ..rgb
        };
        assert!(odd.frame_size().is_none());
        assert!(Frame::new(odd).is_err());
    }

    #[test]
    fn test_length_stays_within_capacity() -> anyhow::Result<()> {
        let mut frame = Frame::with_capacity(4, Pixel::GRAY8)?;
        assert!(frame.is_empty());
        frame.fill_from(&[1, 2, 3])?;
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!(frame.fill_from(&[0; 5]).is_err());
        assert!(frame.set_len(5).is_err());
        assert_eq!(frame.len(), 3);

        frame.set_timestamp(40);
        frame.clear();
        assert!(frame.is_empty());
        assert_eq!(frame.timestamp(), 0);
        Ok(())
    }

    #[test]
    fn test_pts_to_milliseconds() {
        assert_eq!(pts_ms(90_000, Rational::new(1, 90_000)), 1000);
        assert_eq!(pts_ms(3, Rational::new(1, 25)), 120);
        assert_eq!(pts_ms(7, Rational::new(1, 0)), 0);
    }
}
