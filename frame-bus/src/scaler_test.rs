use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video;

use super::{Scaler, copy_from_plane, copy_into_plane};
use crate::frame::{Frame, FrameLayout};

fn gradient(layout: FrameLayout) -> Vec<u8> {
    let size = layout.frame_size().unwrap();
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_plane_copy_respects_stride() -> anyhow::Result<()> {
    ffmpeg_next::init()?;
    // odd width so the plane is padded past the packed row
    let layout = FrameLayout::rgb24(7, 3);
    let row = layout.row_size().unwrap();
    let packed = gradient(layout);

    let mut plane = Video::new(Pixel::RGB24, layout.width, layout.height);
    assert!(plane.stride(0) >= row);
    copy_into_plane(&packed, row, &mut plane)?;

    let mut frame = Frame::new(layout)?;
    copy_from_plane(&plane, row, &mut frame)?;
    assert_eq!(frame.data(), &packed[..]);
    assert_eq!(frame.format(), Pixel::RGB24);
    Ok(())
}

#[test]
fn test_plane_copy_rejects_short_input() -> anyhow::Result<()> {
    ffmpeg_next::init()?;
    let mut plane = Video::new(Pixel::RGB24, 4, 4);
    assert!(copy_into_plane(&[0u8; 20], 12, &mut plane).is_err());
    Ok(())
}

#[test]
fn test_plane_copy_rejects_small_frame() -> anyhow::Result<()> {
    ffmpeg_next::init()?;
    let plane = Video::new(Pixel::RGB24, 4, 4);
    let mut frame = Frame::with_capacity(16, Pixel::RGB24)?;
    assert!(copy_from_plane(&plane, 12, &mut frame).is_err());
    Ok(())
}

#[test]
fn test_yuv_round_trip_keeps_black_black() -> anyhow::Result<()> {
    ffmpeg_next::init()?;
    let layout = FrameLayout::rgb24(16, 16);
    let row = layout.row_size().unwrap();
    let mut to_yuv = Scaler::convert(Pixel::RGB24, Pixel::YUV420P, 16, 16)?;
    let mut to_rgb = Scaler::convert(Pixel::YUV420P, Pixel::RGB24, 16, 16)?;
    assert_eq!(to_yuv.output_format(), Pixel::YUV420P);
    assert_eq!(to_rgb.input_format(), Pixel::YUV420P);

    let mut rgb = Video::new(Pixel::RGB24, 16, 16);
    copy_into_plane(&vec![0u8; layout.frame_size().unwrap()], row, &mut rgb)?;
    let mut yuv = Video::new(Pixel::YUV420P, 16, 16);
    to_yuv.run(&rgb, &mut yuv)?;
    let mut back = Video::new(Pixel::RGB24, 16, 16);
    to_rgb.run(&yuv, &mut back)?;

    let mut frame = Frame::new(layout)?;
    copy_from_plane(&back, row, &mut frame)?;
    assert!(frame.data().iter().all(|&v| v < 8));
    Ok(())
}
