//! Per-session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// A rectangular region of the framebuffer, used for partial-area
/// subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Primary pixel encoding offered to the server. The driver always accepts
/// Raw rectangles in addition to the negotiated one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredEncoding {
    Raw,
    #[default]
    Tight,
    Zrle,
}

impl std::fmt::Display for PreferredEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreferredEncoding::Raw => write!(f, "raw"),
            PreferredEncoding::Tight => write!(f, "tight"),
            PreferredEncoding::Zrle => write!(f, "zrle"),
        }
    }
}

/// Configuration for one VNC session.
///
/// Level options are `None` to leave the corresponding pseudo-encoding out
/// of the SetEncodings message entirely; out-of-range values are clamped
/// with a warning rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP target, `host:port`.
    pub address: String,

    /// VNC Authentication password. Only the first eight bytes are used by
    /// the protocol.
    pub password: String,

    /// Primary encoding offered in SetEncodings.
    pub encoding: PreferredEncoding,

    /// JPEG quality hint, 0 (worst) to 9 (best).
    pub quality_level: Option<i32>,

    /// zlib effort hint, 0 (least) to 9 (most compression).
    pub compress_level: Option<i32>,

    /// Fine-grained quality hint, 0 to 100.
    pub fine_quality_level: Option<i32>,

    /// Chroma subsampling hint, 0 (full color) to 3 (grayscale).
    pub subsample_level: Option<i32>,

    /// Cumulative retry budget for the initial connect, in seconds. Zero
    /// fails on the first soft error instead of retrying.
    pub start_timeout_secs: u64,

    /// How many decoded updates may pile up between steps before the driver
    /// stops requesting more from the server.
    pub max_deferred_updates: usize,

    /// Regions to request instead of the whole framebuffer. Empty means the
    /// full screen.
    pub subscription: Vec<Region>,

    /// Bit positions of the red/green/blue channels in the negotiated
    /// 32-bit little-endian pixel. Must be byte-aligned.
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            password: String::new(),
            encoding: PreferredEncoding::default(),
            quality_level: None,
            compress_level: None,
            fine_quality_level: None,
            subsample_level: None,
            start_timeout_secs: 0,
            max_deferred_updates: 60,
            subscription: Vec::new(),
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }
}

impl SessionConfig {
    /// Validate the options that cannot be repaired by clamping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "address".to_string(),
                message: "must be a host:port target".to_string(),
            });
        }

        for (field, shift) in [
            ("red_shift", self.red_shift),
            ("green_shift", self.green_shift),
            ("blue_shift", self.blue_shift),
        ] {
            if shift % 8 != 0 || shift > 24 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("{shift} is not a byte-aligned shift within 32 bits"),
                });
            }
        }

        if self.max_deferred_updates == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_deferred_updates".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Clamp the level hints into their valid ranges, warning about any
    /// value that had to move.
    pub(crate) fn normalized(mut self) -> Self {
        self.quality_level = clamp_level(&self.address, "quality level", self.quality_level, 0, 9);
        self.compress_level =
            clamp_level(&self.address, "compress level", self.compress_level, 0, 9);
        self.fine_quality_level = clamp_level(
            &self.address,
            "fine quality level",
            self.fine_quality_level,
            0,
            100,
        );
        self.subsample_level =
            clamp_level(&self.address, "subsample level", self.subsample_level, 0, 3);
        self
    }

    pub(crate) fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

fn clamp_level(
    address: &str,
    name: &str,
    value: Option<i32>,
    min: i32,
    max: i32,
) -> Option<i32> {
    let value = value?;
    if value < min {
        warn!(
            address,
            requested = value,
            "{name} below valid range {min}..{max}, using {min}"
        );
        Some(min)
    } else if value > max {
        warn!(
            address,
            requested = value,
            "{name} above valid range {min}..{max}, using {max}"
        );
        Some(max)
    } else {
        Some(value)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}
