// Only the V4L2 device backend decodes captured buffers.
#![cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]

use anyhow::{anyhow, Result};

use crate::frame::RawFrame;

/// Buffer encodings a capture device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CaptureEncoding {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl CaptureEncoding {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" | b"JPEG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer into an RGB8 `RawFrame`.
///
/// An empty buffer yields an empty frame rather than an error; the pipeline
/// skips those ticks.
pub(crate) fn decode_frame(
    pixels: &[u8],
    width: u32,
    height: u32,
    encoding: CaptureEncoding,
) -> Result<RawFrame> {
    if pixels.is_empty() {
        return Ok(RawFrame::empty());
    }
    match encoding {
        CaptureEncoding::Rgb24 => RawFrame::from_rgb(pixels.to_vec(), width, height),
        CaptureEncoding::Yuyv => RawFrame::from_rgb(yuyv_to_rgb(pixels, width, height)?, width, height),
        CaptureEncoding::Mjpeg => RawFrame::from_jpeg(pixels),
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", w));
    }
    let expected = w
        .checked_mul(h)
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame too short: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    // Each 4-byte group carries two pixels sharing one chroma pair.
    for group in pixels[..expected].chunks_exact(4) {
        let u = group[1] as f32 - 128.0;
        let v = group[3] as f32 - 128.0;
        for y in [group[0], group[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402_f32 * v));
            rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
            rgb.push(clamp_to_u8(y + 1.772_f32 * u));
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_neutral_chroma_produces_gray() -> Result<()> {
        let yuyv = vec![128u8; 2 * 2 * 2];
        let frame = decode_frame(&yuyv, 2, 2, CaptureEncoding::Yuyv)?;
        assert_eq!((frame.width, frame.height), (2, 2));
        assert!(frame.image().iter().all(|&b| b == 128));
        Ok(())
    }

    #[test]
    fn yuyv_rejects_short_buffers() {
        assert!(decode_frame(&[128u8; 6], 2, 2, CaptureEncoding::Yuyv).is_err());
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let frame = decode_frame(&[1u8; 9], 1, 3, CaptureEncoding::Rgb24)?;
        assert_eq!(frame.image().as_raw(), &vec![1u8; 9]);
        assert!(decode_frame(&[1u8; 8], 1, 3, CaptureEncoding::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn empty_buffer_is_empty_frame() -> Result<()> {
        assert!(decode_frame(&[], 640, 360, CaptureEncoding::Mjpeg)?.is_empty());
        Ok(())
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(CaptureEncoding::from_fourcc(b"MJPG"), Some(CaptureEncoding::Mjpeg));
        assert_eq!(CaptureEncoding::from_fourcc(b"YUYV"), Some(CaptureEncoding::Yuyv));
        assert_eq!(CaptureEncoding::from_fourcc(b"H264"), None);
    }
}
