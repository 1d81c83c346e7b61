//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing from local device nodes
//! (e.g. /dev/video0).
//!
//! At open time the device is asked for MJPG at the configured width, height
//! and frame rate. Devices that refuse keep their own format; frames are then
//! decoded from whatever encoding the device reports (MJPG, YUYV or RGB3) and
//! delivered at the device's native resolution.

use anyhow::Result;
#[cfg(feature = "ingest-v4l2")]
use anyhow::Context;
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
#[cfg(feature = "ingest-v4l2")]
use std::time::{Duration, Instant};

use super::synthetic::SyntheticFrames;
use super::{FrameSource, SourceStats};
use crate::frame::RawFrame;
#[cfg(feature = "ingest-v4l2")]
use super::normalize::{decode_frame, CaptureEncoding};

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 20,
            width: 640,
            height: 360,
        }
    }
}

/// V4L2 frame source.
///
/// Uses libv4l for real devices, with a synthetic fallback for `stub://` paths.
pub struct V4l2Source {
    backend: V4l2Backend,
}

enum V4l2Backend {
    Synthetic(SyntheticV4l2Source),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Result<Self> {
        if config.device.starts_with("stub://") {
            Ok(Self {
                backend: V4l2Backend::Synthetic(SyntheticV4l2Source::new(config)),
            })
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Self {
                    backend: V4l2Backend::Device(DeviceV4l2Source::new(config)),
                })
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!(
                    "capture device {} requires the ingest-v4l2 feature",
                    config.device
                )
            }
        }
    }
}

impl FrameSource for V4l2Source {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.open(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.open(),
        }
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.acquire(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.acquire(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.close(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.close(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.open,
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.state.is_some(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.open,
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            V4l2Backend::Synthetic(source) => SourceStats {
                frames_captured: source.frames.frames_generated(),
                source: source.config.device.clone(),
            },
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => SourceStats {
                frames_captured: source.frame_count,
                source: source.config.device.clone(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticV4l2Source {
    config: V4l2Config,
    frames: SyntheticFrames,
    open: bool,
}

impl SyntheticV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            frames: SyntheticFrames::new(config.width, config.height),
            config,
            open: false,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!(
            "V4l2Source: opened {} ({}x{} @ {} fps, synthetic)",
            self.config.device,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        if !self.open {
            anyhow::bail!("v4l2 device {} not open", self.config.device);
        }
        Ok(self.frames.next_frame())
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            log::info!("V4l2Source: closed {}", self.config.device);
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceV4l2Source {
    config: V4l2Config,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
    active_encoding: CaptureEncoding,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            active_encoding: CaptureEncoding::Mjpeg,
            config,
            state: None,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set MJPG {}x{} on {}: {}",
                    self.config.width,
                    self.config.height,
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let encoding = CaptureEncoding::from_fourcc(&format.fourcc.repr).with_context(|| {
            format!(
                "v4l2 device {} delivers unsupported encoding {}",
                self.config.device, format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_encoding = encoding;
        self.last_error = None;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{} {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.active_encoding
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, encoding) =
            (self.active_width, self.active_height, self.active_encoding);
        let state = self.state.as_mut().context("v4l2 device not open")?;
        let frame = state
            .with_mut(|fields| -> Result<RawFrame> {
                let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
                let used = (meta.bytesused as usize).min(buf.len());
                decode_frame(&buf[..used], width, height, encoding)
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                err
            })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Ok(frame)
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: closed {}", self.config.device);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.state.is_none() || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
