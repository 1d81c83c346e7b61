//! Output selection shared between the tick loop and the control handler.
//!
//! The selection is a single `AtomicU8`, so the control handler replaces both
//! flags in one store and a tick never sees half of an update.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// One of the two published image channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Large,
    Small,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Large => write!(f, "large"),
            Channel::Small => write!(f, "small"),
        }
    }
}

/// Which outputs are enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputSelection {
    None = 0,
    Large = 1,
    #[default]
    Small = 2,
    Both = 3,
}

impl OutputSelection {
    pub fn from_flags(large: bool, small: bool) -> Self {
        match (large, small) {
            (false, false) => Self::None,
            (true, false) => Self::Large,
            (false, true) => Self::Small,
            (true, true) => Self::Both,
        }
    }

    pub fn large_enabled(self) -> bool {
        matches!(self, Self::Large | Self::Both)
    }

    pub fn small_enabled(self) -> bool {
        matches!(self, Self::Small | Self::Both)
    }

    /// Channels to compute and publish this tick.
    ///
    /// Under `Exclusive`, large wins over small when both are enabled.
    pub fn targets(self, policy: PublishPolicy) -> &'static [Channel] {
        match (self, policy) {
            (Self::None, _) => &[],
            (Self::Large, _) => &[Channel::Large],
            (Self::Small, _) => &[Channel::Small],
            (Self::Both, PublishPolicy::Exclusive) => &[Channel::Large],
            (Self::Both, PublishPolicy::Dual) => &[Channel::Large, Channel::Small],
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Large,
            2 => Self::Small,
            3 => Self::Both,
            _ => Self::None,
        }
    }
}

impl FromStr for OutputSelection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "large" => Ok(Self::Large),
            "small" => Ok(Self::Small),
            "both" => Ok(Self::Both),
            other => Err(anyhow!(
                "unknown output selection '{}': expected none, large, small or both",
                other
            )),
        }
    }
}

impl fmt::Display for OutputSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Large => write!(f, "large"),
            Self::Small => write!(f, "small"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// How a `Both` selection is published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishPolicy {
    /// One channel per tick, large first.
    #[default]
    Exclusive,
    /// Both channels every tick; small is derived from the large composition.
    Dual,
}

impl FromStr for PublishPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exclusive" | "single" => Ok(Self::Exclusive),
            "dual" | "both" => Ok(Self::Dual),
            other => Err(anyhow!(
                "unknown publish policy '{}': expected 'exclusive' or 'dual'",
                other
            )),
        }
    }
}

/// Current output selection.
#[derive(Debug)]
pub struct OutputSelector {
    state: AtomicU8,
}

impl OutputSelector {
    pub fn new(initial: OutputSelection) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    /// Replace both flags at once. Returns the previous selection.
    pub fn set(&self, large: bool, small: bool) -> OutputSelection {
        self.set_selection(OutputSelection::from_flags(large, small))
    }

    pub fn set_selection(&self, selection: OutputSelection) -> OutputSelection {
        OutputSelection::from_u8(self.state.swap(selection as u8, Ordering::AcqRel))
    }

    pub fn snapshot(&self) -> OutputSelection {
        OutputSelection::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply an inbound control message.
    pub fn apply(&self, msg: &ControlMessage) -> OutputSelection {
        let selection = msg.selection();
        let previous = self.set_selection(selection);
        if previous != selection {
            log::info!("output selection changed: {} -> {}", previous, selection);
        }
        selection
    }
}

impl Default for OutputSelector {
    fn default() -> Self {
        Self::new(OutputSelection::default())
    }
}

/// Inbound control payload.
///
/// `{"enable_large_broadcast": true, "enable_small_broadcast": false}`
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    #[serde(default)]
    pub enable_large_broadcast: bool,
    #[serde(default)]
    pub enable_small_broadcast: bool,
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("parse camera control message")
    }

    pub fn selection(&self) -> OutputSelection {
        OutputSelection::from_flags(self.enable_large_broadcast, self.enable_small_broadcast)
    }
}
