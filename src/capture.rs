//! Streaming capture engine.
//!
//! [`Capture`] owns one device handle, the capture parameters and the buffer
//! ring, and drives the V4L2 streaming protocol:
//!
//! 1. capability check
//! 2. format negotiation
//! 3. frame-rate negotiation
//! 4. buffer allocation and mapping
//! 5. enqueue every buffer, then stream on
//!
//! Frames are pulled with [`Capture::read_frame`]. Errors never cross the
//! engine boundary; every operation reports success as `bool` or `Option` and
//! logs the cause.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::{V4L2Device, DEFAULT_READ_TIMEOUT};
use crate::params::{CaptureParam, CaptureParams, FormatPolicy, MAX_BUFFERS};
use crate::ring::BufferRing;
use crate::traits::{
    CameraError, Format, Frame, FrameMetadata, MappedMemory, Result, VideoDevice,
};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No usable device handle.
    Closed,
    /// Device open, not streaming.
    Idle,
    /// Buffers allocated and the driver is streaming.
    Streaming,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Idle => write!(f, "idle"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Pull-based frame source over one capture device.
///
/// The engine exclusively owns its device and buffer ring and is not `Clone`.
/// Callers reading from several threads must serialise access themselves.
pub struct Capture<D: VideoDevice = V4L2Device> {
    path: PathBuf,
    device: Option<D>,
    params: CaptureParams,
    ring: BufferRing<D::Mapping>,
    streaming: bool,
    image_step: u32,
    image_size: u32,
    sequence: u64,
    read_timeout: Duration,
}

impl Capture<V4L2Device> {
    /// Open the device at `path`.
    ///
    /// Never fails: if the device cannot be opened the error is logged and the
    /// engine stays [`StreamState::Closed`].
    pub fn open<P: AsRef<Path>>(path: P, params: CaptureParams) -> Self {
        let path = path.as_ref();
        let device = match V4L2Device::open(path) {
            Ok(device) => Some(device),
            Err(err) => {
                error!(device = %path.display(), error = %err, "cannot open capture device");
                None
            }
        };
        Self::build(path.to_path_buf(), device, params)
    }
}

impl<D: VideoDevice> Capture<D> {
    /// Build an engine over an already opened device.
    pub fn with_device<P: AsRef<Path>>(path: P, device: D, params: CaptureParams) -> Self {
        Self::build(path.as_ref().to_path_buf(), Some(device), params)
    }

    fn build(path: PathBuf, device: Option<D>, mut params: CaptureParams) -> Self {
        if !CaptureParams::is_valid_buffer_count(params.buffer_count) {
            let clamped = params.buffer_count.clamp(1, MAX_BUFFERS);
            warn!(
                requested = params.buffer_count,
                clamped, "buffer count out of range"
            );
            params.buffer_count = clamped;
        }

        Self {
            path,
            device,
            params,
            ring: BufferRing::default(),
            streaming: false,
            image_step: 0,
            image_size: 0,
            sequence: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Whether the engine holds an open device handle.
    pub fn is_opened(&self) -> bool {
        self.device.as_ref().is_some_and(VideoDevice::is_open)
    }

    /// Whether the driver is streaming.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        if !self.is_opened() {
            StreamState::Closed
        } else if self.streaming {
            StreamState::Streaming
        } else {
            StreamState::Idle
        }
    }

    /// Path the engine was opened with.
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Bytes per line of the negotiated format, 0 before the first start.
    pub const fn image_step(&self) -> u32 {
        self.image_step
    }

    /// Frame size in bytes of the negotiated format, 0 before the first start.
    pub const fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Number of buffers currently mapped.
    pub fn buffer_ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Current parameter set, including driver corrections.
    pub const fn params(&self) -> &CaptureParams {
        &self.params
    }

    /// Read one parameter.
    pub const fn get(&self, param: CaptureParam) -> u32 {
        self.params.get(param)
    }

    /// Change one parameter for the next [`Capture::start_streaming`].
    ///
    /// Rejected while streaming and for a buffer count outside `1..=32`.
    pub fn set(&mut self, param: CaptureParam, value: u32) -> bool {
        if self.streaming {
            warn!(?param, value, "cannot change parameters while streaming");
            return false;
        }
        if !self.params.set(param, value) {
            warn!(?param, value, "parameter value out of range");
            return false;
        }
        true
    }

    /// Change the format negotiation policy. Rejected while streaming.
    pub fn set_format_policy(&mut self, policy: FormatPolicy) -> bool {
        if self.streaming {
            warn!(?policy, "cannot change format policy while streaming");
            return false;
        }
        self.params.format_policy = policy;
        true
    }

    /// Set how long [`Capture::read_frame`] waits for the device to become readable.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Negotiate, allocate buffers and start streaming.
    ///
    /// Idempotent while streaming. On failure no buffers stay allocated and the
    /// engine remains idle.
    pub fn start_streaming(&mut self) -> bool {
        if !self.is_opened() {
            warn!(device = %self.path.display(), "start on closed device");
            return false;
        }
        if self.streaming {
            return true;
        }

        match self.start() {
            Ok(()) => {
                self.streaming = true;
                info!(
                    device = %self.path.display(),
                    width = self.params.width,
                    height = self.params.height,
                    fourcc = %self.params.pixel_format,
                    fps = self.params.frame_rate,
                    buffers = self.ring.len(),
                    "streaming started"
                );
                true
            }
            Err(err) => {
                error!(device = %self.path.display(), error = %err, "cannot start streaming");
                false
            }
        }
    }

    /// Run the start sequence. Driver corrections reach `params` only once the
    /// driver is streaming.
    fn start(&mut self) -> Result<()> {
        let device = self.device.as_mut().ok_or(CameraError::DeviceClosed)?;

        check_capabilities(device)?;

        let format = negotiate_format(device, &self.params)?;
        if !matches_request(&format, &self.params) {
            warn!(
                width = format.width,
                height = format.height,
                fourcc = %format.fourcc,
                "driver adjusted format"
            );
        }

        let rate = device.set_frame_rate(1, self.params.frame_rate)?;
        if rate.denominator != self.params.frame_rate {
            warn!(
                requested = self.params.frame_rate,
                granted = rate.denominator,
                "driver adjusted frame rate"
            );
        }

        let granted = self.ring.allocate(device, self.params.buffer_count)?;

        let streamed = self
            .ring
            .enqueue_all(device)
            .and_then(|()| device.stream_on());
        if let Err(err) = streamed {
            self.ring.release(device);
            return Err(err);
        }

        self.params.width = format.width;
        self.params.height = format.height;
        self.params.pixel_format = format.fourcc;
        self.params.frame_rate = rate.denominator;
        self.params.buffer_count = granted;
        self.image_step = format.stride;
        self.image_size = format.size;
        Ok(())
    }

    /// Stop streaming and release the buffer ring.
    ///
    /// Idempotent while idle. If the driver refuses to stop, the engine stays
    /// streaming and `false` is returned.
    pub fn stop_streaming(&mut self) -> bool {
        let Some(device) = self.device.as_mut().filter(|device| device.is_open()) else {
            warn!(device = %self.path.display(), "stop on closed device");
            return false;
        };
        if !self.streaming {
            return true;
        }

        if let Err(err) = device.stream_off() {
            error!(device = %self.path.display(), error = %err, "cannot stop streaming");
            return false;
        }
        self.streaming = false;

        if !self.ring.release(device) {
            warn!(device = %self.path.display(), "buffers not fully released");
        }
        info!(device = %self.path.display(), "streaming stopped");
        true
    }

    /// Pull one frame.
    ///
    /// Returns `None` when not streaming, when nothing became readable within
    /// the read timeout, and when the dequeued buffer was corrupted or short.
    pub fn read_frame(&mut self) -> Option<Frame> {
        if !self.streaming {
            return None;
        }
        let device = self.device.as_mut()?;
        if !device.is_readable(self.read_timeout) {
            return None;
        }

        let buffer = match device.dequeue() {
            Ok(buffer) => buffer,
            Err(CameraError::NotReady) => {
                debug!("device not ready for reading");
                return None;
            }
            Err(err) => {
                error!(device = %self.path.display(), error = %err, "cannot dequeue buffer");
                return None;
            }
        };

        if buffer.error || buffer.bytes_used != self.image_size {
            warn!(
                index = buffer.index,
                bytes_used = buffer.bytes_used,
                expected = self.image_size,
                flagged = buffer.error,
                "discarding corrupted buffer"
            );
            requeue(device, buffer.index);
            return None;
        }

        let Some(slot) = self.ring.get(buffer.index) else {
            error!(index = buffer.index, "driver returned unknown buffer");
            requeue(device, buffer.index);
            return None;
        };
        if slot.len() < buffer.bytes_used as usize {
            warn!(
                index = buffer.index,
                bytes_used = buffer.bytes_used,
                mapped = slot.len(),
                "discarding buffer larger than its mapping"
            );
            requeue(device, buffer.index);
            return None;
        }
        let data = slot.memory().copy_prefix(buffer.bytes_used as usize);
        requeue(device, buffer.index);

        let sequence = self.sequence;
        self.sequence += 1;

        Some(Frame {
            data,
            metadata: FrameMetadata {
                sequence,
                timestamp: buffer.timestamp,
                bytes_used: buffer.bytes_used,
            },
        })
    }

    /// Stop streaming if needed, release the buffers and close the handle.
    ///
    /// Buffers are released even when the driver refuses to stop streaming.
    /// Returns `false` if the engine was already closed or closing failed.
    pub fn close(&mut self) -> bool {
        let Some(mut device) = self.device.take() else {
            return false;
        };

        if self.streaming {
            if let Err(err) = device.stream_off() {
                warn!(device = %self.path.display(), error = %err, "stream off failed during close");
            }
            self.streaming = false;
        }
        self.ring.release(&mut device);

        device.close()
    }
}

impl<D: VideoDevice> Drop for Capture<D> {
    fn drop(&mut self) {
        if self.device.is_some() {
            self.close();
        }
    }
}

impl<D: VideoDevice> fmt::Debug for Capture<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("params", &self.params)
            .field("buffers", &self.ring.len())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

fn matches_request(format: &Format, params: &CaptureParams) -> bool {
    format.width == params.width
        && format.height == params.height
        && format.fourcc == params.pixel_format
}

fn check_capabilities<D: VideoDevice>(device: &D) -> Result<()> {
    let caps = device.query_capabilities()?;
    debug!(driver = %caps.driver, card = %caps.card, flags = caps.flags, "capabilities");

    if !caps.can_capture() {
        return Err(CameraError::MissingCapability("video capture"));
    }
    if !caps.can_stream() {
        return Err(CameraError::MissingCapability("streaming"));
    }
    let input = device.current_input()?;
    if let Some(reason) = input.fault() {
        return Err(CameraError::InputRejected {
            index: input.index,
            reason: reason.to_owned(),
        });
    }
    debug!(index = input.index, name = %input.name, kind = %input.kind, "input");
    Ok(())
}

fn negotiate_format<D: VideoDevice>(device: &mut D, params: &CaptureParams) -> Result<Format> {
    let strict = params.format_policy == FormatPolicy::Strict;
    let mismatch = |actual: Format| CameraError::FormatMismatch {
        requested: Format::new(params.width, params.height, params.pixel_format),
        actual,
    };

    let tried = device.try_format(params.pixel_format, params.width, params.height)?;
    if strict && !matches_request(&tried, params) {
        return Err(mismatch(tried));
    }

    let format = device.set_format(params.pixel_format, params.width, params.height)?;
    if strict && !matches_request(&format, params) {
        return Err(mismatch(format));
    }
    Ok(format)
}

fn requeue<D: VideoDevice>(device: &mut D, index: u32) {
    if let Err(err) = device.enqueue(index) {
        error!(index, error = %err, "cannot requeue buffer");
    }
}
