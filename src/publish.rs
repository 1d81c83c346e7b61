//! Outbound image channels.
//!
//! The pipeline hands composed frames to a `FramePublisher`; it never sees the
//! transport. Topic names embed the base topic and each canvas's resolution.

use anyhow::Result;

use crate::frame::{CanvasSpec, ComposedFrame};
use crate::output::Channel;

const CONTROL_TOPIC_SUFFIX: &str = "camera_control";

/// Sink for composed frames.
///
/// Delivery is best effort: implementations may drop frames when the transport
/// is backed up, and subscribers only care about the most recent one.
pub trait FramePublisher: Send {
    fn publish(&self, channel: Channel, frame: &ComposedFrame) -> Result<()>;
}

impl<P: FramePublisher + Sync + ?Sized> FramePublisher for std::sync::Arc<P> {
    fn publish(&self, channel: Channel, frame: &ComposedFrame) -> Result<()> {
        (**self).publish(channel, frame)
    }
}

impl<P: FramePublisher + ?Sized> FramePublisher for Box<P> {
    fn publish(&self, channel: Channel, frame: &ComposedFrame) -> Result<()> {
        (**self).publish(channel, frame)
    }
}

/// Topic names for one camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelTopics {
    pub large: String,
    pub small: String,
    pub control: String,
}

impl ChannelTopics {
    pub fn new(base_topic: &str, large: &CanvasSpec, small: &CanvasSpec) -> Self {
        let base = base_topic.trim_end_matches('/');
        Self {
            large: image_topic(base, large),
            small: image_topic(base, small),
            control: format!("{}/{}", base, CONTROL_TOPIC_SUFFIX),
        }
    }

    pub fn image(&self, channel: Channel) -> &str {
        match channel {
            Channel::Large => &self.large,
            Channel::Small => &self.small,
        }
    }
}

/// `<base>/image_<W>x<H>`
pub fn image_topic(base_topic: &str, canvas: &CanvasSpec) -> String {
    format!("{}/image_{}", base_topic, canvas)
}
