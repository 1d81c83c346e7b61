//! Synthetic frames for `stub://` sources.
//!
//! A diagonal gradient that drifts one step per frame, so consecutive frames
//! differ and orientation/letterboxing are visible in the output.

use image::{Rgb, RgbImage};

use crate::frame::RawFrame;

pub(crate) struct SyntheticFrames {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticFrames {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    pub(crate) fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn next_frame(&mut self) -> RawFrame {
        self.frame_count += 1;
        let drift = self.frame_count;
        let (w, h) = (self.width.max(1), self.height.max(1));
        RawFrame::new(RgbImage::from_fn(self.width, self.height, |x, y| {
            let r = (u64::from(x) * 255 / u64::from(w)) as u8;
            let g = (u64::from(y) * 255 / u64::from(h)) as u8;
            let b = ((u64::from(x) + u64::from(y) + drift) % 256) as u8;
            Rgb([r, g, b])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_configured_size_and_drift() {
        let mut frames = SyntheticFrames::new(64, 48);
        let first = frames.next_frame();
        let second = frames.next_frame();
        assert_eq!((first.width, first.height), (64, 48));
        assert_ne!(first.image(), second.image());
        assert_eq!(frames.frames_generated(), 2);
    }
}
