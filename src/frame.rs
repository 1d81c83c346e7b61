//! Frame containers.
//!
//! - `RawFrame`: one decoded image as delivered by a source. Lives for a single tick.
//! - `ComposedFrame`: an image sized exactly to a `CanvasSpec`, ready to publish.
//! - `CanvasSpec`: fixed output geometry for the large and small channels.
//!
//! All pixel data is packed RGB8. Sources normalize whatever the device delivers
//! (MJPG, YUYV, RGB3) before a `RawFrame` is built.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::fmt;

/// Pixel layout of an output canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per channel, R G B order, no padding.
    #[default]
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Output canvas geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanvasSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl CanvasSpec {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgb8,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

impl fmt::Display for CanvasSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// A decoded frame as reported by the source.
///
/// Not `Clone`: a raw frame is handed from acquisition to composition and then
/// dropped. Nothing keeps it past the tick that produced it.
pub struct RawFrame {
    image: RgbImage,

    /// Dimensions reported by the source.
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            width,
            height,
        }
    }

    /// Build a frame from packed RGB8 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .context("RGB buffer does not match frame dimensions")?;
        Ok(Self::new(image))
    }

    /// Decode a JPEG (or MJPG frame) into RGB8.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .context("decode jpeg frame")?;
        Ok(Self::new(decoded.to_rgb8()))
    }

    /// A frame with no pixels. Sources return this when the device hands back
    /// an empty buffer.
    pub fn empty() -> Self {
        Self::new(RgbImage::new(0, 0))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.image.is_empty()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// ComposedFrame
// ----------------------------------------------------------------------------

/// An image sized to a canvas. Owns its own buffer.
#[derive(Clone, PartialEq)]
pub struct ComposedFrame {
    image: RgbImage,
}

impl ComposedFrame {
    pub(crate) fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn matches(&self, canvas: &CanvasSpec) -> bool {
        self.width() == canvas.width && self.height() == canvas.height
    }

    /// Encode as a baseline JPEG color image.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.image.len() / 8);
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode_image(&self.image)
            .context("encode jpeg frame")?;
        Ok(out)
    }
}

impl fmt::Debug for ComposedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedFrame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_frame_validates_length() {
        assert!(RawFrame::from_rgb(vec![0u8; 11], 2, 2).is_err());
        let frame = RawFrame::from_rgb(vec![7u8; 12], 2, 2).expect("frame");
        assert_eq!((frame.width, frame.height), (2, 2));
        assert!(!frame.is_empty());
    }

    #[test]
    fn empty_frame_reports_empty() {
        assert!(RawFrame::empty().is_empty());
    }

    #[test]
    fn composed_frame_encodes_jpeg() -> Result<()> {
        let frame = ComposedFrame::from_image(RgbImage::from_pixel(32, 16, image::Rgb([200, 10, 10])));
        let jpeg = frame.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = RawFrame::from_jpeg(&jpeg)?;
        assert_eq!((decoded.width, decoded.height), (32, 16));
        Ok(())
    }

    #[test]
    fn canvas_display_is_resolution() {
        assert_eq!(CanvasSpec::new(640, 360).to_string(), "640x360");
        assert_eq!(CanvasSpec::new(256, 144).byte_len(), 256 * 144 * 3);
    }
}
