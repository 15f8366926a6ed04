//! Capture frames from a V4L2 device and log them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use v4l2_mmap_capture::{Capture, CaptureParams, FormatPolicy, FourCC, V4L2Device};

#[derive(Parser, Debug)]
#[command(name = "v4l2-capture")]
#[command(about = "Pull frames from a V4L2 device over mmap streaming I/O")]
#[command(version)]
struct Cli {
    /// Device node
    #[arg(default_value = "/dev/video0")]
    device: PathBuf,

    /// TOML file with capture parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frame width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Pixel format as a four character code, e.g. YUYV
    #[arg(long)]
    fourcc: Option<String>,

    /// Number of mmap buffers (1-32)
    #[arg(long)]
    buffers: Option<u32>,

    /// Fail if the driver adjusts the requested format
    #[arg(long)]
    strict: bool,

    /// Number of frames to capture, 0 for no limit
    #[arg(short = 'n', long, default_value_t = 100)]
    frames: u64,

    /// List inputs and pixel formats, then exit
    #[arg(long)]
    list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn params(&self) -> Result<CaptureParams> {
        let mut params = match &self.config {
            Some(path) => load_params(path)?,
            None => CaptureParams::default(),
        };

        if let Some(width) = self.width {
            params.width = width;
        }
        if let Some(height) = self.height {
            params.height = height;
        }
        if let Some(fps) = self.fps {
            params.frame_rate = fps;
        }
        if let Some(code) = &self.fourcc {
            params.pixel_format = FourCC::try_from(code.clone()).map_err(anyhow::Error::msg)?;
        }
        if let Some(buffers) = self.buffers {
            params.buffer_count = buffers;
        }
        if self.strict {
            params.format_policy = FormatPolicy::Strict;
        }

        if !params.is_valid() {
            bail!("buffer count must be between 1 and {}", v4l2_mmap_capture::MAX_BUFFERS);
        }
        Ok(params)
    }
}

fn load_params(path: &Path) -> Result<CaptureParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
}

fn list_device(path: &Path) -> Result<()> {
    let device = V4L2Device::open(path)?;

    for input in device.list_inputs() {
        info!(
            index = input.index,
            name = %input.name,
            kind = %input.kind,
            fault = input.fault().unwrap_or("none"),
            "input"
        );
    }
    for format in device.list_formats() {
        info!(
            index = format.index,
            fourcc = %format.fourcc,
            description = %format.description,
            compressed = format.compressed,
            "pixel format"
        );
    }

    let current = device.format()?;
    let rate = device.stream_params()?;
    info!(
        width = current.width,
        height = current.height,
        fourcc = %current.fourcc,
        stride = current.stride,
        size = current.size,
        interval = %format!("{}/{}", rate.numerator, rate.denominator),
        "current format"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if cli.list {
        return list_device(&cli.device);
    }

    let params = cli.params()?;
    info!(device = %cli.device.display(), ?params, "opening device");

    let mut capture = Capture::open(&cli.device, params);
    if !capture.is_opened() {
        bail!("cannot open {}", cli.device.display());
    }
    if !capture.start_streaming() {
        bail!("cannot start streaming on {}", cli.device.display());
    }

    let mut captured = 0_u64;
    let mut misses = 0_u64;
    while cli.frames == 0 || captured < cli.frames {
        let Some(frame) = capture.read_frame() else {
            misses += 1;
            continue;
        };
        captured += 1;
        info!(
            sequence = frame.sequence(),
            bytes = frame.data().len(),
            timestamp = ?frame.timestamp(),
            "frame"
        );
    }

    if !capture.stop_streaming() {
        warn!("device did not stop streaming cleanly");
    }
    info!(captured, misses, "done");
    Ok(())
}
