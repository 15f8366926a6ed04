//! V4L2 device implementation over raw ioctls.
//!
//! This is the only module that talks to the kernel directly. Every request
//! goes through `V4L2Device::ioctl`, which retries on `EINTR` and nothing
//! else.
#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fs;
use std::io;
use std::mem;
use std::os::raw::c_int;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_capability,
    v4l2_field_V4L2_FIELD_ANY, v4l2_fmtdesc, v4l2_format, v4l2_input,
    v4l2_memory_V4L2_MEMORY_MMAP, v4l2_requestbuffers, v4l2_streamparm, V4L2_BUF_FLAG_ERROR,
    V4L2_CAP_DEVICE_CAPS, V4L2_FMT_FLAG_COMPRESSED, V4L2_INPUT_TYPE_CAMERA,
    V4L2_INPUT_TYPE_TUNER, V4L2_IN_ST_NO_POWER, V4L2_IN_ST_NO_SIGNAL,
};

use crate::retry::{is_interrupted, retry_while};
use crate::traits::{
    BufferInfo, CameraError, Capabilities, DequeuedBuffer, Format, FormatDescription, FourCC,
    InputInfo, InputKind, MappedMemory, Result, StreamParams, VideoDevice,
};

/// Sentinel value of a handle that is not open.
const CLOSED_HANDLE: RawFd = -1;

/// Default wait used by readiness polling.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

const BUF_TYPE: u32 = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
const MEMORY_MMAP: u32 = v4l2_memory_V4L2_MEMORY_MMAP;
const INPUT_TYPE_TOUCH: u32 = 3;

/// All-zero value of a kernel argument struct.
///
/// Only used with the plain C structs from `v4l_sys`, for which all-zero is the
/// documented initial state.
fn zeroed<T: Copy>() -> T {
    // SAFETY: callers only instantiate this with bindgen POD structs.
    unsafe { mem::zeroed() }
}

/// Decode a NUL-padded byte array filled in by the kernel.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or_default()).into_owned()
}

fn timestamp(sec: i64, usec: i64) -> Duration {
    let secs = u64::try_from(sec).unwrap_or(0);
    let micros = u32::try_from(usec).unwrap_or(0);
    Duration::new(secs, micros.saturating_mul(1000))
}

fn format_from_raw(fmt: &v4l2_format) -> Format {
    // SAFETY: `pix` is the active member for single-planar capture formats.
    let pix = unsafe { fmt.fmt.pix };
    Format {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from_u32(pix.pixelformat),
        stride: pix.bytesperline,
        size: pix.sizeimage,
    }
}

/// An open V4L2 device node.
///
/// The handle is released by [`VideoDevice::close`]; dropping an open device
/// closes it as well.
#[derive(Debug)]
pub struct V4L2Device {
    fd: RawFd,
    path: PathBuf,
}

impl V4L2Device {
    /// Open a capture device node read/write and non-blocking.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let metadata = fs::metadata(path).map_err(|source| CameraError::OpenFailed {
            path: display.clone(),
            source,
        })?;

        if !metadata.file_type().is_char_device() {
            warn!(device = %display, "not a character device");
            return Err(CameraError::NotACharacterDevice(display));
        }

        let fd = v4l2::open(path, libc::O_RDWR | libc::O_NONBLOCK).map_err(|source| {
            CameraError::OpenFailed {
                path: display.clone(),
                source,
            }
        })?;

        info!(device = %display, fd, "opened device");

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        if self.fd == CLOSED_HANDLE {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let argp = ptr::from_mut(arg).cast::<c_void>();
        retry_while(
            // SAFETY: `argp` points to a live argument of the type `request` expects.
            || unsafe { v4l2::ioctl(self.fd, request, argp) },
            is_interrupted,
        )
    }

    fn enum_input(&self, index: u32) -> io::Result<InputInfo> {
        let mut input: v4l2_input = zeroed();
        input.index = index;
        self.ioctl(vidioc::VIDIOC_ENUMINPUT, &mut input)?;

        let kind = match input.type_ {
            V4L2_INPUT_TYPE_TUNER => InputKind::Tuner,
            V4L2_INPUT_TYPE_CAMERA => InputKind::Camera,
            INPUT_TYPE_TOUCH => InputKind::Touch,
            other => InputKind::Other(other),
        };

        Ok(InputInfo {
            index: input.index,
            name: c_string(&input.name),
            kind,
            no_power: input.status & V4L2_IN_ST_NO_POWER != 0,
            no_signal: input.status & V4L2_IN_ST_NO_SIGNAL != 0,
        })
    }

    /// Enumerate every video input of the device.
    pub fn list_inputs(&self) -> Vec<InputInfo> {
        (0..).map_while(|index| self.enum_input(index).ok()).collect()
    }

    /// Enumerate the pixel formats the device can capture.
    pub fn list_formats(&self) -> Vec<FormatDescription> {
        let mut formats = Vec::new();

        for index in 0.. {
            let mut desc: v4l2_fmtdesc = zeroed();
            desc.index = index;
            desc.type_ = BUF_TYPE;
            if self.ioctl(vidioc::VIDIOC_ENUM_FMT, &mut desc).is_err() {
                break;
            }

            formats.push(FormatDescription {
                index,
                fourcc: FourCC::from_u32(desc.pixelformat),
                description: c_string(&desc.description),
                compressed: desc.flags & V4L2_FMT_FLAG_COMPRESSED != 0,
            });
        }

        if formats.is_empty() {
            warn!(device = %self.path.display(), "no supported pixel formats");
        }

        formats
    }

    /// Current capture format.
    pub fn format(&self) -> Result<Format> {
        let mut fmt: v4l2_format = zeroed();
        fmt.type_ = BUF_TYPE;
        self.ioctl(vidioc::VIDIOC_G_FMT, &mut fmt)
            .map_err(CameraError::FormatRejected)?;
        Ok(format_from_raw(&fmt))
    }

    /// Current frame interval.
    pub fn stream_params(&self) -> Result<StreamParams> {
        let mut parm: v4l2_streamparm = zeroed();
        parm.type_ = BUF_TYPE;
        self.ioctl(vidioc::VIDIOC_G_PARM, &mut parm)
            .map_err(CameraError::FrameRateRejected)?;

        // SAFETY: `capture` is the active member for capture buffer types.
        let interval = unsafe { parm.parm.capture.timeperframe };
        Ok(StreamParams {
            numerator: interval.numerator,
            denominator: interval.denominator,
        })
    }

    fn negotiate_format(
        &self,
        request: vidioc::_IOC_TYPE,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Format> {
        let mut fmt: v4l2_format = zeroed();
        fmt.type_ = BUF_TYPE;
        // SAFETY: `pix` is the active member for single-planar capture formats.
        unsafe {
            fmt.fmt.pix.width = width;
            fmt.fmt.pix.height = height;
            fmt.fmt.pix.pixelformat = fourcc.to_u32();
            fmt.fmt.pix.field = v4l2_field_V4L2_FIELD_ANY;
        }

        self.ioctl(request, &mut fmt)
            .map_err(CameraError::FormatRejected)?;
        Ok(format_from_raw(&fmt))
    }
}

impl AsRawFd for V4L2Device {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for V4L2Device {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}

/// A buffer mapped with `mmap(2)`.
///
/// Not unmapped on drop; hand it back to [`VideoDevice::unmap_buffer`].
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedMemory for MmapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn copy_prefix(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.len);
        // SAFETY: the region stays mapped until `unmap_buffer` consumes it, and the
        // driver does not write to a buffer while it is dequeued.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) }.to_vec()
    }
}

impl VideoDevice for V4L2Device {
    type Mapping = MmapRegion;

    fn is_open(&self) -> bool {
        self.fd != CLOSED_HANDLE
    }

    fn close(&mut self) -> bool {
        if self.fd == CLOSED_HANDLE {
            warn!(device = %self.path.display(), "close on invalid handle");
            return false;
        }

        let fd = mem::replace(&mut self.fd, CLOSED_HANDLE);
        match v4l2::close(fd) {
            Ok(()) => {
                info!(device = %self.path.display(), fd, "closed device");
                true
            }
            Err(err) => {
                error!(device = %self.path.display(), fd, error = %err, "cannot close device");
                false
            }
        }
    }

    fn query_capabilities(&self) -> Result<Capabilities> {
        let mut caps: v4l2_capability = zeroed();
        self.ioctl(vidioc::VIDIOC_QUERYCAP, &mut caps)
            .map_err(CameraError::QueryFailed)?;

        let flags = if caps.capabilities & V4L2_CAP_DEVICE_CAPS == 0 {
            caps.capabilities
        } else {
            caps.device_caps
        };

        Ok(Capabilities {
            driver: c_string(&caps.driver),
            card: c_string(&caps.card),
            bus_info: c_string(&caps.bus_info),
            version: caps.version,
            flags,
        })
    }

    fn current_input(&self) -> Result<InputInfo> {
        let mut current: c_int = 0;
        self.ioctl(vidioc::VIDIOC_G_INPUT, &mut current)
            .map_err(CameraError::InputQueryFailed)?;

        let index = u32::try_from(current).map_err(|_| {
            CameraError::InputQueryFailed(io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        self.enum_input(index).map_err(CameraError::InputQueryFailed)
    }

    fn try_format(&self, fourcc: FourCC, width: u32, height: u32) -> Result<Format> {
        self.negotiate_format(vidioc::VIDIOC_TRY_FMT, fourcc, width, height)
    }

    fn set_format(&mut self, fourcc: FourCC, width: u32, height: u32) -> Result<Format> {
        self.negotiate_format(vidioc::VIDIOC_S_FMT, fourcc, width, height)
    }

    fn set_frame_rate(&mut self, numerator: u32, denominator: u32) -> Result<StreamParams> {
        let mut parm: v4l2_streamparm = zeroed();
        parm.type_ = BUF_TYPE;
        // SAFETY: `capture` is the active member for capture buffer types.
        unsafe {
            parm.parm.capture.timeperframe.numerator = numerator;
            parm.parm.capture.timeperframe.denominator = denominator;
        }

        self.ioctl(vidioc::VIDIOC_S_PARM, &mut parm)
            .map_err(CameraError::FrameRateRejected)?;

        // SAFETY: as above.
        let interval = unsafe { parm.parm.capture.timeperframe };
        Ok(StreamParams {
            numerator: interval.numerator,
            denominator: interval.denominator,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut req: v4l2_requestbuffers = zeroed();
        req.count = count;
        req.type_ = BUF_TYPE;
        req.memory = MEMORY_MMAP;

        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req).map_err(|err| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                error!(device = %self.path.display(), "device does not support memory mapping");
            }
            CameraError::BufferRequestFailed(err)
        })?;

        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;
        buf.index = index;

        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)
            .map_err(|source| CameraError::BufferQueryFailed { index, source })?;

        // SAFETY: `offset` is the active member for MMAP buffers.
        let offset = unsafe { buf.m.offset };
        Ok(BufferInfo {
            index,
            length: buf.length,
            offset,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Mapping> {
        let index = info.index;
        let len = info.length as usize;

        #[allow(clippy::cast_possible_wrap)]
        let offset = info.offset as libc::off_t;

        // SAFETY: length and offset were reported by VIDIOC_QUERYBUF for this fd.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )
        }
        .map_err(|source| CameraError::MapFailed { index, source })?;

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| CameraError::MapFailed {
            index,
            source: io::Error::other("mmap returned a null mapping"),
        })?;

        debug!(index, len, "mapped buffer");
        Ok(MmapRegion { ptr, len })
    }

    fn unmap_buffer(&mut self, index: u32, mapping: Self::Mapping) -> Result<()> {
        // SAFETY: the region came from `map_buffer` and is consumed here.
        unsafe { v4l2::munmap(mapping.ptr.as_ptr().cast::<c_void>(), mapping.len) }
            .map_err(|source| CameraError::UnmapFailed { index, source })
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;
        buf.index = index;

        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
            .map_err(|source| CameraError::EnqueueFailed { index, source })
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY_MMAP;

        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf).map_err(|err| {
            if err.raw_os_error() == Some(libc::EAGAIN) {
                CameraError::NotReady
            } else {
                CameraError::DequeueFailed(err)
            }
        })?;

        #[allow(clippy::useless_conversion)]
        let timestamp = timestamp(
            i64::from(buf.timestamp.tv_sec),
            i64::from(buf.timestamp.tv_usec),
        );

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            error: buf.flags & V4L2_BUF_FLAG_ERROR != 0,
            sequence: buf.sequence,
            timestamp,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut kind = BUF_TYPE;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut kind)
            .map_err(CameraError::StreamOnFailed)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut kind = BUF_TYPE;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut kind)
            .map_err(CameraError::StreamOffFailed)
    }

    fn is_readable(&self, timeout: Duration) -> bool {
        if self.fd == CLOSED_HANDLE {
            return false;
        }

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        // SAFETY: `pfd` is a live local and the count matches.
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
            -1 => {
                warn!(fd = self.fd, error = %io::Error::last_os_error(), "poll failed");
                false
            }
            0 => false,
            _ => pfd.revents & libc::POLLIN != 0,
        }
    }
}
