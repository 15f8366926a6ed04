//! Simulated V4L2 driver for testing without hardware.
//!
//! [`MockDevice`] is handed to the code under test; the paired
//! [`MockController`] stays with the test to inject frames, arm faults and
//! inspect driver-side state.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::retry::{is_interrupted, retry_while};
use crate::traits::{
    BufferInfo, CameraError, Capabilities, DequeuedBuffer, Format, FourCC, InputInfo, InputKind,
    MappedMemory, Result, StreamParams, VideoDevice,
};

/// Test pattern types for injected frames.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Every byte set to the given value.
    Solid(u8),
    /// Bytes counting up from zero and wrapping at 256.
    Ramp,
}

impl TestPattern {
    /// Generate `len` bytes of this pattern.
    #[allow(clippy::cast_possible_truncation)]
    pub fn generate(self, len: usize) -> Vec<u8> {
        match self {
            Self::Solid(value) => vec![value; len],
            Self::Ramp => (0..len).map(|i| i as u8).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    capability_query: bool,
    try_format: bool,
    set_format: bool,
    frame_rate: bool,
    query_buffer_at: Option<u32>,
    map_at: Option<u32>,
    enqueue: bool,
    stream_on: bool,
    stream_off: bool,
    dequeue_io: bool,
    interrupts: u32,
    spurious_wakeups: u32,
}

#[derive(Debug)]
struct DriverState {
    open: bool,
    capabilities: Capabilities,
    input: InputInfo,
    format: Format,
    forced_format: Option<(u32, u32, FourCC)>,
    max_frame_rate: Option<u32>,
    frame_rate: StreamParams,
    max_buffers: u32,
    buffer_length: Option<usize>,
    buffers: Vec<Rc<RefCell<Vec<u8>>>>,
    mapped: usize,
    incoming: VecDeque<u32>,
    outgoing: VecDeque<DequeuedBuffer>,
    streaming: bool,
    sequence: u32,
    faults: Faults,
}

impl DriverState {
    fn new() -> Self {
        Self {
            open: true,
            capabilities: Capabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                version: 0x0006_0800,
                flags: (v4l::capability::Flags::VIDEO_CAPTURE
                    | v4l::capability::Flags::STREAMING)
                    .bits(),
            },
            input: InputInfo {
                index: 0,
                name: "Camera 0".to_owned(),
                kind: InputKind::Camera,
                no_power: false,
                no_signal: false,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            forced_format: None,
            max_frame_rate: None,
            frame_rate: StreamParams {
                numerator: 1,
                denominator: 30,
            },
            max_buffers: crate::params::MAX_BUFFERS,
            buffer_length: None,
            buffers: Vec::new(),
            mapped: 0,
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            streaming: false,
            sequence: 0,
            faults: Faults::default(),
        }
    }

    fn adjusted_format(&self, fourcc: FourCC, width: u32, height: u32) -> Format {
        let (width, height, fourcc) = self.forced_format.unwrap_or((width, height, fourcc));
        Format::new(width, height, fourcc)
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EBADF))
        }
    }

    fn fill(&mut self, data: &[u8], bytes_used: u32, error: bool) -> bool {
        if !self.streaming {
            return false;
        }
        let Some(index) = self.incoming.pop_front() else {
            return false;
        };

        if let Some(buffer) = self.buffers.get(index as usize) {
            let mut memory = buffer.borrow_mut();
            let len = data.len().min(memory.len());
            if let (Some(dst), Some(src)) = (memory.get_mut(..len), data.get(..len)) {
                dst.copy_from_slice(src);
            }
        }

        let sequence = self.sequence;
        self.sequence += 1;
        self.outgoing.push_back(DequeuedBuffer {
            index,
            bytes_used,
            error,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33),
        });
        true
    }
}

/// Mapping of a simulated driver buffer.
#[derive(Debug)]
pub struct MockMapping {
    memory: Rc<RefCell<Vec<u8>>>,
}

impl MappedMemory for MockMapping {
    fn len(&self) -> usize {
        self.memory.borrow().len()
    }

    fn copy_prefix(&self, len: usize) -> Vec<u8> {
        let memory = self.memory.borrow();
        memory.get(..len.min(memory.len())).unwrap_or_default().to_vec()
    }
}

/// Simulated capture device.
pub struct MockDevice {
    state: Rc<RefCell<DriverState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create an open device exposing YUYV 640x480 at 30 fps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(DriverState::new())),
        }
    }

    /// Controller sharing this device's driver state.
    pub fn controller(&self) -> MockController {
        MockController {
            state: Rc::clone(&self.state),
        }
    }
}

/// Test-side handle on a [`MockDevice`].
#[derive(Clone)]
pub struct MockController {
    state: Rc<RefCell<DriverState>>,
}

impl MockController {
    /// Fill the next queued buffer with `data` and move it to the outgoing queue.
    ///
    /// Returns `false` if the driver is not streaming or owns no queued buffer.
    pub fn inject_frame(&self, data: &[u8]) -> bool {
        let bytes_used = u32::try_from(data.len()).unwrap_or(u32::MAX);
        self.state.borrow_mut().fill(data, bytes_used, false)
    }

    /// Fill the next queued buffer with a full-size frame of `pattern`.
    pub fn inject_pattern(&self, pattern: TestPattern) -> bool {
        let size = self.state.borrow().format.size as usize;
        self.inject_frame(&pattern.generate(size))
    }

    /// Complete the next queued buffer with `bytes_used` bytes and the error flag set.
    pub fn inject_error(&self, bytes_used: u32) -> bool {
        self.state.borrow_mut().fill(&[], bytes_used, true)
    }

    /// Complete the next queued buffer with `bytes_used` bytes and no error flag.
    pub fn inject_short(&self, bytes_used: u32) -> bool {
        let data = vec![0xAA; bytes_used as usize];
        self.state.borrow_mut().fill(&data, bytes_used, false)
    }

    /// Replace the reported capabilities.
    pub fn set_capabilities(&self, flags: v4l::capability::Flags) {
        self.state.borrow_mut().capabilities.flags = flags.bits();
    }

    /// Replace the current input.
    pub fn set_input(&self, input: InputInfo) {
        self.state.borrow_mut().input = input;
    }

    /// Make `VIDIOC_QUERYCAP` fail.
    pub fn fail_capability_query(&self) {
        self.state.borrow_mut().faults.capability_query = true;
    }

    /// Make the driver answer every format request with this format.
    pub fn force_format(&self, width: u32, height: u32, fourcc: FourCC) {
        self.state.borrow_mut().forced_format = Some((width, height, fourcc));
    }

    /// Make `VIDIOC_TRY_FMT` fail.
    pub fn fail_try_format(&self) {
        self.state.borrow_mut().faults.try_format = true;
    }

    /// Make `VIDIOC_S_FMT` fail.
    pub fn fail_set_format(&self) {
        self.state.borrow_mut().faults.set_format = true;
    }

    /// Make `VIDIOC_S_PARM` fail.
    pub fn fail_frame_rate(&self) {
        self.state.borrow_mut().faults.frame_rate = true;
    }

    /// Cap the frame rate the driver grants.
    pub fn cap_frame_rate(&self, max: u32) {
        self.state.borrow_mut().max_frame_rate = Some(max);
    }

    /// Grant at most `max` buffers.
    pub fn limit_buffers(&self, max: u32) {
        self.state.borrow_mut().max_buffers = max;
    }

    /// Allocate buffers of `len` bytes regardless of the committed format.
    pub fn set_buffer_length(&self, len: usize) {
        self.state.borrow_mut().buffer_length = Some(len);
    }

    /// Make `VIDIOC_QUERYBUF` fail for buffer `index`.
    pub fn fail_query_buffer_at(&self, index: u32) {
        self.state.borrow_mut().faults.query_buffer_at = Some(index);
    }

    /// Make mapping buffer `index` fail.
    pub fn fail_map_at(&self, index: u32) {
        self.state.borrow_mut().faults.map_at = Some(index);
    }

    /// Make `VIDIOC_QBUF` fail.
    pub fn fail_enqueue(&self, fail: bool) {
        self.state.borrow_mut().faults.enqueue = fail;
    }

    /// Make `VIDIOC_STREAMON` fail.
    pub fn fail_stream_on(&self) {
        self.state.borrow_mut().faults.stream_on = true;
    }

    /// Make `VIDIOC_STREAMOFF` fail.
    pub fn fail_stream_off(&self, fail: bool) {
        self.state.borrow_mut().faults.stream_off = fail;
    }

    /// Make `VIDIOC_DQBUF` fail with `EIO`.
    pub fn fail_dequeue_io(&self, fail: bool) {
        self.state.borrow_mut().faults.dequeue_io = fail;
    }

    /// Interrupt the next `count` dequeue attempts with `EINTR`.
    pub fn interrupt_dequeues(&self, count: u32) {
        self.state.borrow_mut().faults.interrupts = count;
    }

    /// Report readiness once without a filled buffer.
    pub fn spurious_wakeup(&self) {
        self.state.borrow_mut().faults.spurious_wakeups += 1;
    }

    /// Number of buffers currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.state.borrow().mapped
    }

    /// Number of buffers the driver currently holds.
    pub fn granted_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    /// Indices in the incoming queue, oldest first.
    pub fn queued_indices(&self) -> Vec<u32> {
        self.state.borrow().incoming.iter().copied().collect()
    }

    /// Whether the driver is streaming.
    pub fn is_streaming(&self) -> bool {
        self.state.borrow().streaming
    }

    /// Whether the device handle is open.
    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    /// Committed format.
    pub fn format(&self) -> Format {
        self.state.borrow().format.clone()
    }

    /// Overwrite the driver-side contents of buffer `index`.
    pub fn scribble(&self, index: u32, value: u8) {
        if let Some(buffer) = self.state.borrow().buffers.get(index as usize) {
            buffer.borrow_mut().fill(value);
        }
    }
}

impl VideoDevice for MockDevice {
    type Mapping = MockMapping;

    fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    fn close(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        std::mem::replace(&mut state.open, false)
    }

    fn query_capabilities(&self) -> Result<Capabilities> {
        let state = self.state.borrow();
        state.ensure_open().map_err(CameraError::QueryFailed)?;
        if state.faults.capability_query {
            return Err(CameraError::QueryFailed(io::Error::from_raw_os_error(
                libc::ENOTTY,
            )));
        }
        Ok(state.capabilities.clone())
    }

    fn current_input(&self) -> Result<InputInfo> {
        let state = self.state.borrow();
        state.ensure_open().map_err(CameraError::InputQueryFailed)?;
        Ok(state.input.clone())
    }

    fn try_format(&self, fourcc: FourCC, width: u32, height: u32) -> Result<Format> {
        let state = self.state.borrow();
        state.ensure_open().map_err(CameraError::FormatRejected)?;
        if state.faults.try_format {
            return Err(CameraError::FormatRejected(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        Ok(state.adjusted_format(fourcc, width, height))
    }

    fn set_format(&mut self, fourcc: FourCC, width: u32, height: u32) -> Result<Format> {
        let mut state = self.state.borrow_mut();
        state.ensure_open().map_err(CameraError::FormatRejected)?;
        if state.faults.set_format || !state.buffers.is_empty() {
            return Err(CameraError::FormatRejected(io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }
        state.format = state.adjusted_format(fourcc, width, height);
        Ok(state.format.clone())
    }

    fn set_frame_rate(&mut self, numerator: u32, denominator: u32) -> Result<StreamParams> {
        let mut state = self.state.borrow_mut();
        state.ensure_open().map_err(CameraError::FrameRateRejected)?;
        if state.faults.frame_rate {
            return Err(CameraError::FrameRateRejected(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        let denominator = state
            .max_frame_rate
            .map_or(denominator, |max| denominator.min(max));
        state.frame_rate = StreamParams {
            numerator,
            denominator,
        };
        Ok(state.frame_rate)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        state.ensure_open().map_err(CameraError::BufferRequestFailed)?;
        if state.streaming || state.mapped > 0 {
            return Err(CameraError::BufferRequestFailed(io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }

        let granted = count.min(state.max_buffers);
        let size = state.buffer_length.unwrap_or(state.format.size as usize);
        state.buffers = (0..granted)
            .map(|_| Rc::new(RefCell::new(vec![0; size])))
            .collect();
        state.incoming.clear();
        state.outgoing.clear();
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let state = self.state.borrow();
        let buffer = state
            .buffers
            .get(index as usize)
            .filter(|_| state.faults.query_buffer_at != Some(index))
            .ok_or_else(|| CameraError::BufferQueryFailed {
                index,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            })?;
        let length = u32::try_from(buffer.borrow().len()).unwrap_or(u32::MAX);
        Ok(BufferInfo {
            index,
            length,
            offset: index.saturating_mul(length),
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Mapping> {
        let mut state = self.state.borrow_mut();
        if state.faults.map_at == Some(info.index) {
            return Err(CameraError::MapFailed {
                index: info.index,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        let memory = state
            .buffers
            .get(info.index as usize)
            .map(Rc::clone)
            .ok_or_else(|| CameraError::MapFailed {
                index: info.index,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            })?;
        state.mapped += 1;
        Ok(MockMapping { memory })
    }

    fn unmap_buffer(&mut self, _index: u32, _mapping: Self::Mapping) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.mapped = state.mapped.saturating_sub(1);
        Ok(())
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let errno = if state.faults.enqueue {
            Some(libc::EIO)
        } else if index as usize >= state.buffers.len() || state.incoming.contains(&index) {
            Some(libc::EINVAL)
        } else {
            None
        };
        if let Some(errno) = errno {
            return Err(CameraError::EnqueueFailed {
                index,
                source: io::Error::from_raw_os_error(errno),
            });
        }
        state.incoming.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        let state = &self.state;
        retry_while(
            || {
                let mut state = state.borrow_mut();
                if state.faults.interrupts > 0 {
                    state.faults.interrupts -= 1;
                    return Err(io::Error::from_raw_os_error(libc::EINTR));
                }
                if state.faults.dequeue_io {
                    return Err(io::Error::from_raw_os_error(libc::EIO));
                }
                state
                    .outgoing
                    .pop_front()
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))
            },
            is_interrupted,
        )
        .map_err(|err| {
            if err.raw_os_error() == Some(libc::EAGAIN) {
                CameraError::NotReady
            } else {
                CameraError::DequeueFailed(err)
            }
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.faults.stream_on || state.buffers.is_empty() {
            return Err(CameraError::StreamOnFailed(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.faults.stream_off {
            return Err(CameraError::StreamOffFailed(io::Error::from_raw_os_error(
                libc::EIO,
            )));
        }
        state.streaming = false;
        state.incoming.clear();
        state.outgoing.clear();
        Ok(())
    }

    fn is_readable(&self, _timeout: Duration) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.streaming {
            return false;
        }
        if state.faults.spurious_wakeups > 0 {
            state.faults.spurious_wakeups -= 1;
            return true;
        }
        !state.outgoing.is_empty() || state.faults.dequeue_io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_capabilities() {
        let device = MockDevice::new();
        let caps = device
            .query_capabilities()
            .expect("query_capabilities should succeed");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture());
        assert!(caps.can_stream());
        assert!(device.check_input());
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new();
        let format = device
            .set_format(FourCC::YUYV, 1280, 720)
            .expect("set_format should succeed");
        assert_eq!(format.width, 1280);
        assert_eq!(format.height, 720);
        assert_eq!(format.size, 1280 * 720 * 2);

        device.controller().force_format(320, 240, FourCC::GREY);
        let format = device
            .try_format(FourCC::YUYV, 640, 480)
            .expect("try_format should succeed");
        assert_eq!((format.width, format.fourcc), (320, FourCC::GREY));
    }

    #[test]
    fn test_mock_dequeue_retries_interrupts() {
        let mut device = MockDevice::new();
        let driver = device.controller();
        device.request_buffers(2).expect("request_buffers should succeed");
        device.enqueue(0).expect("enqueue should succeed");
        device.stream_on().expect("stream_on should succeed");
        assert!(driver.inject_pattern(TestPattern::Solid(7)));

        driver.interrupt_dequeues(3);
        let buffer = device.dequeue().expect("dequeue should succeed");
        assert_eq!(buffer.index, 0);
        assert_eq!(buffer.bytes_used, 614_400);

        assert!(matches!(device.dequeue(), Err(CameraError::NotReady)));
    }

    #[test]
    fn test_mock_rejects_double_enqueue() {
        let mut device = MockDevice::new();
        device.request_buffers(1).expect("request_buffers should succeed");
        device.enqueue(0).expect("enqueue should succeed");
        assert!(matches!(
            device.enqueue(0),
            Err(CameraError::EnqueueFailed { index: 0, .. })
        ));
    }

    #[test]
    fn test_patterns() {
        assert_eq!(TestPattern::Solid(9).generate(3), vec![9, 9, 9]);
        let ramp = TestPattern::Ramp.generate(300);
        assert_eq!(ramp.get(255), Some(&255));
        assert_eq!(ramp.get(256), Some(&0));
    }
}
