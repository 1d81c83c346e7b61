//! camfeed: camera capture, compositing and MQTT image feed.
//!
//! A single camera is read at a fixed rate, each frame is fitted onto a fixed
//! canvas (stretched for local devices, letterboxed for network streams,
//! optionally rotated 180°) and published as JPEG to one of two sizes. Which
//! sizes are published is switched at runtime by control messages.
//!
//! # Module Structure
//!
//! - `frame`: Raw and composed frame types, canvas geometry
//! - `ingest`: Frame sources (V4L2 devices, RTSP streams, synthetic `stub://`)
//! - `compose`: Stretch / letterbox / flip onto the output canvases
//! - `output`: Output selection shared between the control path and the tick loop
//! - `publish`: The `FramePublisher` seam and topic naming
//! - `pipeline`: The periodic acquire → compose → publish loop and its lifecycle
//! - `transport`: MQTT connection, control subscription and JPEG publisher
//! - `config`: Layered file / environment configuration

pub mod compose;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod transport;

pub use compose::{Compositor, LetterboxGeometry};
pub use config::{AcquisitionMode, CaptureConfig, FeedConfig, MqttSettings, OpenRetryPolicy};
pub use frame::{CanvasSpec, ComposedFrame, PixelFormat, RawFrame};
pub use ingest::{build_source, FrameSource, RtspConfig, RtspSource, V4l2Config, V4l2Source};
pub use output::{Channel, ControlMessage, OutputSelection, OutputSelector, PublishPolicy};
pub use pipeline::{
    IntervalTicker, ManualTicker, Pipeline, PipelineController, PipelineSettings, PipelineState,
    SkipReason, StatsSnapshot, StopSignal, TickHandle, TickOutcome, Ticker,
};
pub use publish::{image_topic, ChannelTopics, FramePublisher};
