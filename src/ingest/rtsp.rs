//! RTSP frame source.
//!
//! This module provides `RtspSource` for pulling frames from network cameras.
//!
//! The stream's resolution belongs to the upstream encoder; frames are
//! delivered at whatever size the stream carries and may change aspect ratio
//! between sessions. The compositor letterboxes them onto the canvas.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::synthetic::SyntheticFrames;
use super::{FrameSource, SourceStats};
use crate::frame::RawFrame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate. Bounds how long a frame pull may block.
    pub target_fps: u32,
    /// Frame width for synthetic streams.
    pub width: u32,
    /// Frame height for synthetic streams.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 20,
            width: 704,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.acquire(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.acquire(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.open,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connected_at.is_some(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.open,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => SourceStats {
                frames_captured: source.frames.frames_generated(),
                source: source.config.url.clone(),
            },
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => SourceStats {
                frames_captured: source.frame_count,
                source: source.config.url.clone(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frames: SyntheticFrames,
    open: bool,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            frames: SyntheticFrames::new(config.width, config.height),
            config,
            open: false,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!(
            "RtspSource: connected to {} ({}x{}, synthetic)",
            self.config.url,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        if !self.open {
            anyhow::bail!("RTSP stream {} not connected", self.config.url);
        }
        Ok(self.frames.next_frame())
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            log::info!("RtspSource: disconnected from {}", self.config.url);
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` producing RGB.
    ///
    /// The appsink keeps only the newest buffer, so a slow tick never reads a
    /// backlog of stale frames.
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start RTSP stream {}", self.config.url))?;

        // Wait for preroll so an unreachable camera fails here rather than on the first tick.
        let (result, _, _) = self
            .pipeline
            .state(gstreamer::ClockTime::from_seconds(5));
        if let Err(err) = result {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            self.poll_bus();
            return Err(anyhow::anyhow!(
                "RTSP stream {} did not start: {:?} ({})",
                self.config.url,
                err,
                self.last_error.as_deref().unwrap_or("no bus error")
            ));
        }

        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn acquire(&mut self) -> Result<RawFrame> {
        if self.connected_at.is_none() {
            anyhow::bail!("RTSP stream {} not connected", self.config.url);
        }
        self.poll_bus();

        let timeout = self.frame_timeout();
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        if pixels.is_empty() {
            return Ok(RawFrame::empty());
        }
        RawFrame::from_rgb(pixels, width, height)
    }

    fn close(&mut self) {
        if self.connected_at.take().is_some() {
            if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop {}: {}", self.config.url, err);
            }
            log::info!("RtspSource: disconnected from {}", self.config.url);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = (row_bytes * height as usize).min(data.len());
        return Ok((data[..len].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 20,
            width: 704,
            height: 480,
        }
    }

    #[test]
    fn rtsp_source_delivers_stream_resolution() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open()?;

        let frame = source.acquire()?;
        assert_eq!(frame.width, 704);
        assert_eq!(frame.height, 480);

        Ok(())
    }

    #[test]
    fn rtsp_frames_change_between_pulls() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open()?;

        let first = source.acquire()?;
        let second = source.acquire()?;
        assert_ne!(first.image(), second.image());
        assert_eq!(source.stats().frames_captured, 2);

        Ok(())
    }

    #[test]
    fn rtsp_acquire_after_close_fails() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open()?;
        source.close();
        assert!(source.acquire().is_err());
        assert!(!source.is_healthy());
        Ok(())
    }
}
