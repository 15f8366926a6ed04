//! v4l2-mmap-capture: pull-based frame capture over V4L2 memory-mapped streaming I/O
//!
//! The [`device`] layer wraps the kernel ioctls behind the [`VideoDevice`]
//! trait; [`Capture`] drives the streaming protocol on top of it and hands out
//! owned [`Frame`] copies.
//!
//! ```no_run
//! use v4l2_mmap_capture::{Capture, CaptureParams};
//!
//! let mut capture = Capture::open("/dev/video0", CaptureParams::default());
//! if capture.start_streaming() {
//!     if let Some(frame) = capture.read_frame() {
//!         println!("frame {}: {} bytes", frame.sequence(), frame.data().len());
//!     }
//!     capture.stop_streaming();
//! }
//! ```

pub mod capture;
pub mod device;
pub mod params;
pub mod retry;
pub mod ring;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use capture::{Capture, StreamState};
pub use device::V4L2Device;
pub use params::{CaptureParam, CaptureParams, FormatPolicy, MAX_BUFFERS};
pub use traits::{CameraError, Format, FourCC, Frame, FrameMetadata, VideoDevice};
