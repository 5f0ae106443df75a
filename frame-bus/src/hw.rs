//! Hardware encoder discovery with software fallback.

use ffmpeg_next::format::Pixel;

/// First hardware H.264 / HEVC encoder available for the given software
/// codec name, if any.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" | "libopenh264" => {
            &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"]
        }
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}

/// Input format the encoder is fed with: NV12 for hardware encoders,
/// YUV420P otherwise.
pub fn encoder_pixel_format(codec_name: &str) -> Pixel {
    if is_hw_encoder(codec_name) {
        Pixel::NV12
    } else {
        Pixel::YUV420P
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_by_encoder_kind() {
        assert_eq!(encoder_pixel_format("libx264"), Pixel::YUV420P);
        assert_eq!(encoder_pixel_format("h264_nvenc"), Pixel::NV12);
        assert_eq!(encoder_pixel_format("h264_v4l2m2m"), Pixel::NV12);
        assert!(!is_hw_encoder("libopenh264"));
    }

    #[test]
    fn test_unknown_codec_has_no_hw_variant() {
        assert!(find_hw_encoder("mjpeg").is_none());
    }
}
