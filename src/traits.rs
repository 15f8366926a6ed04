//! Core traits and types for the V4L2 device handle layer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// GREY pixel format (8-bit luma).
    pub const GREY: Self = Self::new(b"GREY");
    /// NV12 pixel format (4:2:0 semi-planar).
    pub const NV12: Self = Self::new(b"NV12");

    /// The kernel's `u32` representation (`v4l2_fourcc`, little endian).
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Build a `FourCC` from the kernel's `u32` representation.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Bytes per pixel for packed single-plane formats, `None` otherwise.
    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" | b"UYVY" => Some(2),
            b"RGB3" | b"BGR3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl TryFrom<String> for FourCC {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let code: [u8; 4] = value
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be exactly 4 bytes, got {value:?}"))?;
        Ok(Self(code))
    }
}

impl From<FourCC> for String {
    fn from(fourcc: FourCC) -> Self {
        fourcc.to_string()
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a format for a packed pixel layout.
    ///
    /// Stride and size are derived from the pixel format; formats without a
    /// fixed pixel size fall back to two bytes per pixel. Both saturate at
    /// `u32::MAX`.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width.saturating_mul(fourcc.bytes_per_pixel().unwrap_or(2));
        let size = stride.saturating_mul(height);
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capabilities returned by `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Kernel driver version.
    pub version: u32,
    /// Capability bits of the opened device node.
    pub flags: u32,
}

impl Capabilities {
    fn contains(&self, flag: v4l::capability::Flags) -> bool {
        v4l::capability::Flags::from_bits_truncate(self.flags).contains(flag)
    }

    /// Whether the device can capture video.
    pub fn can_capture(&self) -> bool {
        self.contains(v4l::capability::Flags::VIDEO_CAPTURE)
    }

    /// Whether the device supports streaming I/O.
    pub fn can_stream(&self) -> bool {
        self.contains(v4l::capability::Flags::STREAMING)
    }
}

/// Kind of a video input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Tuner input.
    Tuner,
    /// Camera input.
    Camera,
    /// Touch input.
    Touch,
    /// Any type this crate does not know about.
    Other(u32),
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuner => f.write_str("tuner"),
            Self::Camera => f.write_str("camera"),
            Self::Touch => f.write_str("touch"),
            Self::Other(kind) => write!(f, "unknown ({kind})"),
        }
    }
}

/// A video input as enumerated by `VIDIOC_ENUMINPUT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    /// Input index.
    pub index: u32,
    /// Input name.
    pub name: String,
    /// Input kind.
    pub kind: InputKind,
    /// Input has no power.
    pub no_power: bool,
    /// Input has no signal.
    pub no_signal: bool,
}

impl InputInfo {
    /// Human readable reason this input cannot deliver camera frames, if any.
    pub fn fault(&self) -> Option<&'static str> {
        if self.kind != InputKind::Camera {
            Some("not a camera input")
        } else if self.no_power {
            Some("no power")
        } else if self.no_signal {
            Some("no signal")
        } else {
            None
        }
    }
}

/// A pixel format as enumerated by `VIDIOC_ENUM_FMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Format index.
    pub index: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Driver description.
    pub description: String,
    /// Whether the format is compressed.
    pub compressed: bool,
}

/// Streaming parameters (time per frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Time-per-frame numerator.
    pub numerator: u32,
    /// Time-per-frame denominator, i.e. frames per `numerator` seconds.
    pub denominator: u32,
}

/// Kernel-side location of one streaming buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer index.
    pub index: u32,
    /// Buffer length in bytes.
    pub length: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
}

/// A buffer handed back by the driver's outgoing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Buffer index.
    pub index: u32,
    /// Bytes the driver wrote.
    pub bytes_used: u32,
    /// The driver flagged the buffer as errored.
    pub error: bool,
    /// Driver sequence counter.
    pub sequence: u32,
    /// Driver capture timestamp.
    pub timestamp: Duration,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u64,
    /// Driver capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video frame.
///
/// The bytes are an owned copy of the driver buffer and stay valid after the
/// buffer is requeued or the device is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Raw frame bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sequence number assigned at capture.
    pub const fn sequence(&self) -> u64 {
        self.metadata.sequence
    }

    /// Driver capture timestamp.
    pub const fn timestamp(&self) -> Duration {
        self.metadata.timestamp
    }
}

/// Error type for device operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Path exists but is not a character device.
    #[error("{0} is not a character device")]
    NotACharacterDevice(String),
    /// Failed to open the device node.
    #[error("failed to open {path}: {source}")]
    OpenFailed {
        /// Device path.
        path: String,
        /// OS error.
        source: std::io::Error,
    },
    /// Operation on a closed handle.
    #[error("device handle is closed")]
    DeviceClosed,
    /// `VIDIOC_QUERYCAP` failed.
    #[error("capability query failed: {0}")]
    QueryFailed(#[source] std::io::Error),
    /// A required capability bit is missing.
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    /// `VIDIOC_G_INPUT` or `VIDIOC_ENUMINPUT` failed.
    #[error("input query failed: {0}")]
    InputQueryFailed(#[source] std::io::Error),
    /// The current input cannot deliver camera frames.
    #[error("input {index} rejected: {reason}")]
    InputRejected {
        /// Input index.
        index: u32,
        /// Why the input was rejected.
        reason: String,
    },
    /// `VIDIOC_TRY_FMT`, `VIDIOC_S_FMT` or `VIDIOC_G_FMT` failed.
    #[error("format rejected: {0}")]
    FormatRejected(#[source] std::io::Error),
    /// The driver adjusted the requested format under strict negotiation.
    #[error("driver adjusted format {requested:?} to {actual:?}")]
    FormatMismatch {
        /// Requested format.
        requested: Format,
        /// Format the driver would use.
        actual: Format,
    },
    /// `VIDIOC_S_PARM` or `VIDIOC_G_PARM` failed.
    #[error("frame rate rejected: {0}")]
    FrameRateRejected(#[source] std::io::Error),
    /// `VIDIOC_REQBUFS` failed.
    #[error("buffer request failed: {0}")]
    BufferRequestFailed(#[source] std::io::Error),
    /// The driver granted no buffers.
    #[error("driver granted no buffers")]
    NoBuffersAllocated,
    /// `VIDIOC_QUERYBUF` failed.
    #[error("query of buffer {index} failed: {source}")]
    BufferQueryFailed {
        /// Buffer index.
        index: u32,
        /// OS error.
        source: std::io::Error,
    },
    /// Mapping a buffer failed.
    #[error("mapping buffer {index} failed: {source}")]
    MapFailed {
        /// Buffer index.
        index: u32,
        /// OS error.
        source: std::io::Error,
    },
    /// Unmapping a buffer failed.
    #[error("unmapping buffer {index} failed: {source}")]
    UnmapFailed {
        /// Buffer index.
        index: u32,
        /// OS error.
        source: std::io::Error,
    },
    /// `VIDIOC_QBUF` failed.
    #[error("enqueue of buffer {index} failed: {source}")]
    EnqueueFailed {
        /// Buffer index.
        index: u32,
        /// OS error.
        source: std::io::Error,
    },
    /// No filled buffer is available yet.
    #[error("no buffer ready")]
    NotReady,
    /// `VIDIOC_DQBUF` failed for a reason other than "not ready".
    #[error("dequeue failed: {0}")]
    DequeueFailed(#[source] std::io::Error),
    /// `VIDIOC_STREAMON` failed.
    #[error("stream on failed: {0}")]
    StreamOnFailed(#[source] std::io::Error),
    /// `VIDIOC_STREAMOFF` failed.
    #[error("stream off failed: {0}")]
    StreamOffFailed(#[source] std::io::Error),
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Memory shared with the driver for one streaming buffer.
pub trait MappedMemory {
    /// Mapping length in bytes.
    fn len(&self) -> usize;

    /// Whether the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the first `len` bytes (clamped to the mapping length) into an owned buffer.
    fn copy_prefix(&self, len: usize) -> Vec<u8>;
}

/// Primitive, individually failable operations over one open capture device.
///
/// Implementations keep no state besides the handle itself; sequencing is the
/// caller's job.
pub trait VideoDevice {
    /// Mapping type produced by [`VideoDevice::map_buffer`].
    type Mapping: MappedMemory;

    /// Whether the handle is still open.
    fn is_open(&self) -> bool;

    /// Release the handle. Returns `false` if it was already closed or closing failed.
    fn close(&mut self) -> bool;

    /// Query device capabilities.
    fn query_capabilities(&self) -> Result<Capabilities>;

    /// Describe the currently selected input.
    fn current_input(&self) -> Result<InputInfo>;

    /// Check that the selected input is a powered camera input with signal.
    ///
    /// Failures are logged at `warn` and reported as `false`.
    fn check_input(&self) -> bool {
        match self.current_input() {
            Ok(input) => match input.fault() {
                None => true,
                Some(reason) => {
                    warn!(
                        index = input.index,
                        name = %input.name,
                        kind = %input.kind,
                        reason,
                        "unsupported input"
                    );
                    false
                }
            },
            Err(err) => {
                warn!(error = %err, "cannot read current input");
                false
            }
        }
    }

    /// Negotiate a format without committing it.
    fn try_format(&self, fourcc: FourCC, width: u32, height: u32) -> Result<Format>;

    /// Commit a format. Returns the format the driver actually applied.
    fn set_format(&mut self, fourcc: FourCC, width: u32, height: u32) -> Result<Format>;

    /// Request a frame interval. The returned value is authoritative.
    fn set_frame_rate(&mut self, numerator: u32, denominator: u32) -> Result<StreamParams>;

    /// Request `count` mmap buffers. Returns the number the driver granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Look up length and offset of buffer `index`.
    fn query_buffer(&self, index: u32) -> Result<BufferInfo>;

    /// Map a queried buffer into the process.
    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Mapping>;

    /// Unmap a buffer previously returned by [`VideoDevice::map_buffer`].
    fn unmap_buffer(&mut self, index: u32, mapping: Self::Mapping) -> Result<()>;

    /// Hand buffer `index` to the driver's incoming queue.
    fn enqueue(&mut self, index: u32) -> Result<()>;

    /// Take one filled buffer from the driver's outgoing queue.
    fn dequeue(&mut self) -> Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming. Buffers return to the dequeued state.
    fn stream_off(&mut self) -> Result<()>;

    /// Wait up to `timeout` for a filled buffer. Timeouts and poll errors both yield `false`.
    fn is_readable(&self, timeout: Duration) -> bool;
}
