//! Frame acquisition.
//!
//! Two kinds of source feed the pipeline:
//! - `V4l2Source`: a local capture device (feature: ingest-v4l2). The device is
//!   asked for the canvas resolution, frame rate and MJPG encoding at open time.
//! - `RtspSource`: a network stream (feature: rtsp-gstreamer). The upstream
//!   encoder decides the resolution; frames arrive at whatever size it sends.
//!
//! Both accept `stub://` paths, which produce synthetic frames without any
//! hardware or network.
//!
//! A source is opened once and reused across ticks. Frames are decoded to RGB8
//! and handed to the caller; the source does not keep them.

mod normalize;
pub mod rtsp;
mod synthetic;
pub mod v4l2;

use anyhow::Result;

use crate::config::{AcquisitionMode, CaptureConfig};
use crate::frame::RawFrame;

pub use rtsp::{RtspConfig, RtspSource};
pub use v4l2::{V4l2Config, V4l2Source};

/// A device or stream that yields frames on demand.
pub trait FrameSource: Send {
    /// Open the device or stream. Fails if it is unavailable.
    fn open(&mut self) -> Result<()>;

    /// Pull the next frame. May block briefly.
    ///
    /// An empty frame is returned as `Ok` with `RawFrame::is_empty()` set.
    fn acquire(&mut self) -> Result<RawFrame>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        (**self).acquire()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Build the source described by `capture` without opening it.
pub fn build_source(capture: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    match capture.mode {
        AcquisitionMode::Local => {
            let source = V4l2Source::new(V4l2Config {
                device: capture.device_path.clone(),
                target_fps: capture.fps,
                width: capture.native_width,
                height: capture.native_height,
            })?;
            Ok(Box::new(source))
        }
        AcquisitionMode::Network => {
            let source = RtspSource::new(RtspConfig {
                url: capture.device_path.clone(),
                target_fps: capture.fps,
                width: capture.native_width,
                height: capture.native_height,
            })?;
            Ok(Box::new(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_capture(mode: AcquisitionMode) -> CaptureConfig {
        CaptureConfig {
            mode,
            device_path: "stub://test".to_string(),
            fps: 20,
            native_width: 704,
            native_height: 480,
            upside_down: false,
        }
    }

    #[test]
    fn builds_stub_sources_for_both_modes() -> Result<()> {
        for mode in [AcquisitionMode::Local, AcquisitionMode::Network] {
            let mut source = build_source(&stub_capture(mode))?;
            assert!(!source.is_open());
            source.open()?;
            let frame = source.acquire()?;
            assert_eq!((frame.width, frame.height), (704, 480));
            assert_eq!(source.stats().frames_captured, 1);
            source.close();
            assert!(!source.is_open());
        }
        Ok(())
    }
}
