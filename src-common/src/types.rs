//! Types shared with portal front-ends.
//!
//! The numeric values match the `org.freedesktop.portal.ScreenCast` interface
//! so a D-Bus binding can pass them through unchanged.

use serde::{Deserialize, Serialize};

/// Result code returned for every portal request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortalResponse {
    Success,
    /// The user cancelled, or the request could not be satisfied.
    Cancelled,
    /// The interaction ended some other way.
    Ended,
}

impl PortalResponse {
    /// Wire code of the response.
    pub fn code(&self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Cancelled => 1,
            Self::Ended => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Ended),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Kind of source a client may ask to capture. Used as a bit mask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Monitor,
    Window,
    Virtual,
}

impl SourceType {
    pub fn bit(&self) -> u32 {
        match self {
            Self::Monitor => 1,
            Self::Window => 2,
            Self::Virtual => 4,
        }
    }

    /// Whether this source type is present in a mask.
    pub fn is_in(&self, mask: u32) -> bool {
        mask & self.bit() != 0
    }
}

/// How the pointer is represented in the stream. Used as a bit mask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    #[default]
    Hidden,
    /// Cursor drawn into the frames.
    Embedded,
    /// Cursor sent as stream metadata.
    Metadata,
}

impl CursorMode {
    pub fn bit(&self) -> u32 {
        match self {
            Self::Hidden => 1,
            Self::Embedded => 2,
            Self::Metadata => 4,
        }
    }

    pub fn from_bit(bit: u32) -> Option<Self> {
        match bit {
            1 => Some(Self::Hidden),
            2 => Some(Self::Embedded),
            4 => Some(Self::Metadata),
            _ => None,
        }
    }

    /// Whether frames must include the cursor.
    pub fn includes_cursor(&self) -> bool {
        matches!(self, Self::Embedded)
    }
}

/// Whether a granted source selection survives the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    #[default]
    DoNotPersist,
    WhileAppRunning,
    UntilRevoked,
}

impl PersistMode {
    pub fn code(&self) -> u32 {
        match self {
            Self::DoNotPersist => 0,
            Self::WhileAppRunning => 1,
            Self::UntilRevoked => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::DoNotPersist),
            1 => Some(Self::WhileAppRunning),
            2 => Some(Self::UntilRevoked),
            _ => None,
        }
    }
}

/// Options of a SelectSources request.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SelectSourcesOptions {
    /// Source type mask; `None` means monitors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<u32>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_mode: Option<CursorMode>,
    #[serde(default)]
    pub persist_mode: PersistMode,
}

impl SelectSourcesOptions {
    pub fn source_mask(&self) -> u32 {
        self.types.unwrap_or(SourceType::Monitor.bit())
    }
}
