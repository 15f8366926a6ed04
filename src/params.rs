//! Capture parameters.

use serde::{Deserialize, Serialize};

use crate::traits::FourCC;

/// Upper bound for the number of mmap buffers.
pub const MAX_BUFFERS: u32 = 32;

/// Buffer count used when none is configured.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Capture parameter keys for [`CaptureParams::get`] and [`CaptureParams::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureParam {
    /// Frame width in pixels.
    FrameWidth,
    /// Frame height in pixels.
    FrameHeight,
    /// Frame-rate denominator; the numerator is always 1.
    FrameRate,
    /// Pixel format as the kernel's little-endian fourcc value.
    PixelFormat,
    /// Number of mmap buffers.
    BufferCount,
}

/// How format negotiation treats a driver that adjusts the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPolicy {
    /// Accept whatever the driver returns and store it as the effective format.
    #[default]
    Permissive,
    /// Fail negotiation if width, height or pixel format were adjusted.
    Strict,
}

/// Parameter set applied at the next stream start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParams {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Pixel format.
    pub pixel_format: FourCC,
    /// Number of mmap buffers, within `1..=MAX_BUFFERS`.
    pub buffer_count: u32,
    /// Format negotiation policy.
    pub format_policy: FormatPolicy,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
            pixel_format: FourCC::YUYV,
            buffer_count: DEFAULT_BUFFER_COUNT,
            format_policy: FormatPolicy::Permissive,
        }
    }
}

impl CaptureParams {
    /// Create a parameter set with the permissive format policy.
    #[must_use]
    pub fn new(
        pixel_format: FourCC,
        width: u32,
        height: u32,
        frame_rate: u32,
        buffer_count: u32,
    ) -> Self {
        Self {
            width,
            height,
            frame_rate,
            pixel_format,
            buffer_count,
            format_policy: FormatPolicy::Permissive,
        }
    }

    /// Set the format negotiation policy.
    #[must_use]
    pub const fn with_format_policy(mut self, policy: FormatPolicy) -> Self {
        self.format_policy = policy;
        self
    }

    /// Whether `count` is an acceptable buffer count.
    pub const fn is_valid_buffer_count(count: u32) -> bool {
        count >= 1 && count <= MAX_BUFFERS
    }

    /// Whether every value is within its accepted range.
    pub const fn is_valid(&self) -> bool {
        Self::is_valid_buffer_count(self.buffer_count)
    }

    /// Read one parameter.
    pub const fn get(&self, param: CaptureParam) -> u32 {
        match param {
            CaptureParam::FrameWidth => self.width,
            CaptureParam::FrameHeight => self.height,
            CaptureParam::FrameRate => self.frame_rate,
            CaptureParam::PixelFormat => self.pixel_format.to_u32(),
            CaptureParam::BufferCount => self.buffer_count,
        }
    }

    /// Write one parameter. Out-of-range values are rejected without effect.
    pub fn set(&mut self, param: CaptureParam, value: u32) -> bool {
        match param {
            CaptureParam::FrameWidth => self.width = value,
            CaptureParam::FrameHeight => self.height = value,
            CaptureParam::FrameRate => self.frame_rate = value,
            CaptureParam::PixelFormat => self.pixel_format = FourCC::from_u32(value),
            CaptureParam::BufferCount => {
                if !Self::is_valid_buffer_count(value) {
                    return false;
                }
                self.buffer_count = value;
            }
        }
        true
    }
}
