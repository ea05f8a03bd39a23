//! Shared turn-phase state and the small enums that travel with it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The whole system's current turn phase.
///
/// Exactly one value holds at any time. The turn controller is the only
/// writer; every other subsystem reads it (through a `watch` receiver)
/// before starting or restarting work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl AgentState {
    /// Whether a turn is in flight (model call or playback).
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Speaker {
    User,
    Agent,
    System,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "USER",
            Self::Agent => "AGENT",
            Self::System => "SYSTEM",
        };
        f.write_str(s)
    }
}

/// UI feature panels that `navigate` actions may switch to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    #[default]
    Research,
    Text,
    Image,
    Analyze,
    Document,
    Audio,
    Call,
    Email,
    Notepad,
    Settings,
}

impl Feature {
    /// All feature panels in tab order.
    pub const ALL: [Feature; 10] = [
        Feature::Research,
        Feature::Text,
        Feature::Image,
        Feature::Analyze,
        Feature::Document,
        Feature::Audio,
        Feature::Call,
        Feature::Email,
        Feature::Notepad,
        Feature::Settings,
    ];

    /// Stable identifier used in action payloads and events.
    pub fn id(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Text => "text",
            Self::Image => "image",
            Self::Analyze => "analyze",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Call => "call",
            Self::Email => "email",
            Self::Notepad => "notepad",
            Self::Settings => "settings",
        }
    }

    /// Whether a conversational reply is mirrored into this panel's results.
    pub fn receives_text_results(self) -> bool {
        matches!(
            self,
            Self::Text | Self::Research | Self::Analyze | Self::Document
        )
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Error returned when a string names no known feature panel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.id() == s)
            .ok_or_else(|| UnknownFeature(s.to_owned()))
    }
}
