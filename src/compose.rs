//! Frame composition: fit a raw frame onto a fixed canvas.
//!
//! Local devices are asked for the canvas resolution up front, so their frames
//! are copied (or resized when the device ignored the request). Network streams
//! deliver whatever the upstream encoder produces; those frames are scaled so
//! their height fills the canvas and centered horizontally over a black
//! background.
//!
//! A stream that is wider than the canvas after scaling ends up with a negative
//! horizontal offset. The paste is clipped to the canvas, which yields a center
//! crop: the middle `canvas.width` columns of the scaled frame are kept.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::frame::{CanvasSpec, ComposedFrame, RawFrame};

const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Where a letterboxed frame lands on the canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LetterboxGeometry {
    /// canvas.height / raw.height
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    /// Left edge of the scaled frame. Negative when the frame is wider than the canvas.
    pub offset_x: i64,
}

impl LetterboxGeometry {
    pub fn compute(raw_width: u32, raw_height: u32, canvas: &CanvasSpec) -> Result<Self> {
        if raw_width == 0 || raw_height == 0 {
            return Err(anyhow!(
                "cannot letterbox a {}x{} frame",
                raw_width,
                raw_height
            ));
        }
        if canvas.width == 0 || canvas.height == 0 {
            return Err(anyhow!("canvas {} has no area", canvas));
        }

        // Integer form of trunc(raw_width * scale); the height fills the canvas exactly.
        let scaled_width =
            (u64::from(raw_width) * u64::from(canvas.height) / u64::from(raw_height)) as u32;
        if scaled_width == 0 {
            return Err(anyhow!(
                "{}x{} frame collapses to zero width on a {} canvas",
                raw_width,
                raw_height,
                canvas
            ));
        }
        let offset_x = (i64::from(canvas.width) - i64::from(scaled_width)) / 2;

        Ok(Self {
            scale: canvas.height as f32 / raw_height as f32,
            scaled_width,
            scaled_height: canvas.height,
            offset_x,
        })
    }

    /// Columns of black on the left and right of the image (zero when cropped).
    pub fn margins(&self, canvas: &CanvasSpec) -> (u32, u32) {
        if self.offset_x < 0 {
            return (0, 0);
        }
        let left = self.offset_x as u32;
        let right = canvas.width.saturating_sub(left + self.scaled_width);
        (left, right)
    }
}

/// Composes raw frames onto the large canvas and derives the small one.
pub struct Compositor {
    large: CanvasSpec,
    small: CanvasSpec,
    /// All-zero large canvas. Cloned into every letterboxed frame, never written.
    blank: RgbImage,
}

impl Compositor {
    pub fn new(large: CanvasSpec, small: CanvasSpec) -> Self {
        Self {
            blank: RgbImage::new(large.width, large.height),
            large,
            small,
        }
    }

    pub fn blank_canvas(&self) -> &RgbImage {
        &self.blank
    }

    /// Fit `raw` onto the large canvas, then rotate 180° if `orient_flip` is set.
    pub fn compose(&self, raw: &RawFrame, letterbox: bool, orient_flip: bool) -> Result<ComposedFrame> {
        if raw.is_empty() {
            return Err(anyhow!("raw frame is empty"));
        }

        let mut composed = if letterbox {
            self.letterbox(raw)?
        } else {
            self.fit(raw)
        };

        if orient_flip {
            imageops::rotate180_in_place(composed.image_mut());
        }
        Ok(composed)
    }

    /// Resize a large composition down to the small canvas.
    pub fn downscale(&self, large: &ComposedFrame) -> ComposedFrame {
        ComposedFrame::from_image(imageops::resize(
            large.image(),
            self.small.width,
            self.small.height,
            RESIZE_FILTER,
        ))
    }

    fn fit(&self, raw: &RawFrame) -> ComposedFrame {
        let image = raw.image();
        if image.dimensions() == (self.large.width, self.large.height) {
            return ComposedFrame::from_image(image.clone());
        }
        ComposedFrame::from_image(imageops::resize(
            image,
            self.large.width,
            self.large.height,
            RESIZE_FILTER,
        ))
    }

    fn letterbox(&self, raw: &RawFrame) -> Result<ComposedFrame> {
        let geometry = LetterboxGeometry::compute(raw.width, raw.height, &self.large)?;
        let scaled = imageops::resize(
            raw.image(),
            geometry.scaled_width,
            geometry.scaled_height,
            RESIZE_FILTER,
        );

        let mut canvas = self.blank.clone();
        imageops::overlay(&mut canvas, &scaled, geometry.offset_x, 0);
        Ok(ComposedFrame::from_image(canvas))
    }
}
