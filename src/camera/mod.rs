//! Camera capture source.
//!
//! `CameraSource` owns the capture pipeline and the frame lease lifecycle:
//! frames are acquired one at a time out of a bounded buffer pool and must
//! be released back after use. The pool has `fb_count` slots; a lease that
//! is never released starves the pool and subsequent acquires fail.
//!
//! Two backends are available, selected by `CameraConfig::url`:
//! - `stub://…`: synthetic sensor that renders and JPEG-encodes a moving
//!   test pattern (supports `?fault-after=<n>` for fault-path tests)
//! - `http(s)://…`: MJPEG/JPEG upstream standing in for the hardware
//!   sensor on development hosts

use anyhow::{anyhow, bail, Context, Result};
use url::Url;

mod synthetic;
mod upstream;

use synthetic::SyntheticCamera;
use upstream::MjpegUpstream;

const DEFAULT_CAMERA_URL: &str = "stub://sensor";
const DEFAULT_XCLK_FREQ_HZ: u32 = 20_000_000;
const DEFAULT_JPEG_QUALITY: u8 = 12;
const DEFAULT_FB_COUNT: usize = 2;

/// Worst sensor quality setting. Lower values mean better quality.
const MAX_JPEG_QUALITY: u8 = 63;

/// Pin mapping between the controller and the image sensor.
///
/// Defaults match the common AI-Thinker board layout. The mapping is
/// applied once at init and is informational for the synthetic and
/// upstream backends.
#[derive(Clone, Debug)]
pub struct CameraPins {
    pub d0: u8,
    pub d1: u8,
    pub d2: u8,
    pub d3: u8,
    pub d4: u8,
    pub d5: u8,
    pub d6: u8,
    pub d7: u8,
    pub xclk: u8,
    pub pclk: u8,
    pub vsync: u8,
    pub href: u8,
    pub sccb_sda: u8,
    pub sccb_scl: u8,
    pub pwdn: u8,
    /// `None` when the sensor reset line is not wired.
    pub reset: Option<u8>,
}

impl Default for CameraPins {
    fn default() -> Self {
        Self {
            d0: 5,
            d1: 18,
            d2: 19,
            d3: 21,
            d4: 36,
            d5: 39,
            d6: 34,
            d7: 35,
            xclk: 0,
            pclk: 22,
            vsync: 25,
            href: 23,
            sccb_sda: 26,
            sccb_scl: 27,
            pwdn: 32,
            reset: None,
        }
    }
}

/// Sensor output resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSize {
    Qvga,
    Vga,
    Svga,
    Xga,
}

impl FrameSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::Qvga => (320, 240),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "qvga" => Ok(FrameSize::Qvga),
            "vga" => Ok(FrameSize::Vga),
            "svga" => Ok(FrameSize::Svga),
            "xga" => Ok(FrameSize::Xga),
            other => Err(anyhow!("unknown frame size '{}'", other)),
        }
    }
}

/// Sensor output encoding. Only compressed output is supported; the
/// streaming pipeline forwards frames without transcoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Jpeg,
}

/// Frame grab policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GrabMode {
    /// Always hand out the most recent frame, dropping stale ones. Bounds
    /// end-to-end latency under a loaded link: a slow client misses frames
    /// instead of building a backlog.
    #[default]
    Latest,
    /// Strict FIFO; frames are handed out in capture order.
    WhenEmpty,
}

impl GrabMode {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "latest" => Ok(GrabMode::Latest),
            "when_empty" => Ok(GrabMode::WhenEmpty),
            other => Err(anyhow!("unknown grab mode '{}'", other)),
        }
    }
}

/// Frame buffer memory placement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FbLocation {
    #[default]
    Psram,
    Dram,
}

impl FbLocation {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "psram" => Ok(FbLocation::Psram),
            "dram" => Ok(FbLocation::Dram),
            other => Err(anyhow!("unknown frame buffer location '{}'", other)),
        }
    }
}

/// Immutable capture configuration, constructed once at startup.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Source URL selecting the backend: `stub://…` or `http(s)://…`.
    pub url: String,
    pub pins: CameraPins,
    pub xclk_freq_hz: u32,
    pub frame_size: FrameSize,
    pub pixel_format: PixelFormat,
    /// Sensor quality setting, 0 (best) to 63 (worst).
    pub jpeg_quality: u8,
    /// Number of buffer slots in the frame pool.
    pub fb_count: usize,
    pub fb_location: FbLocation,
    pub grab_mode: GrabMode,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CAMERA_URL.to_string(),
            pins: CameraPins::default(),
            xclk_freq_hz: DEFAULT_XCLK_FREQ_HZ,
            frame_size: FrameSize::Vga,
            pixel_format: PixelFormat::Jpeg,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            fb_count: DEFAULT_FB_COUNT,
            fb_location: FbLocation::Psram,
            grab_mode: GrabMode::Latest,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fb_count == 0 {
            bail!("camera fb_count must be at least 1");
        }
        if self.jpeg_quality > MAX_JPEG_QUALITY {
            bail!(
                "camera jpeg_quality {} out of range 0..={}",
                self.jpeg_quality,
                MAX_JPEG_QUALITY
            );
        }
        if self.xclk_freq_hz == 0 {
            bail!("camera xclk_freq_hz must be nonzero");
        }
        Ok(())
    }
}

/// One captured JPEG frame, leased from the camera's buffer pool.
///
/// A frame is exclusively owned by the call site that acquired it and must
/// be handed back via `CameraSource::release_frame` before the next
/// acquire. Frames are never cloned and never retained across streaming
/// iterations.
pub struct Frame {
    data: Vec<u8>,
    seq: u64,
}

impl Frame {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capture sequence number, for diagnostics.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

/// Bounded pool of reusable frame buffers.
///
/// Tracks how many buffers are leased out; an exhausted pool fails the
/// acquire rather than handing out an unbounded allocation.
struct FramePool {
    free: Vec<Vec<u8>>,
    capacity: usize,
    in_flight: usize,
}

impl FramePool {
    fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
            in_flight: 0,
        }
    }

    fn lease(&mut self) -> Result<Vec<u8>> {
        if self.in_flight == self.capacity {
            bail!(
                "frame pool exhausted: all {} buffers are leased",
                self.capacity
            );
        }
        self.in_flight += 1;
        Ok(self.free.pop().unwrap_or_default())
    }

    fn release(&mut self, mut buffer: Vec<u8>) {
        buffer.clear();
        if self.free.len() < self.capacity {
            self.free.push(buffer);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// The device's camera, initialized once at startup.
pub struct CameraSource {
    backend: CameraBackend,
    pool: FramePool,
    frames_captured: u64,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    Upstream(MjpegUpstream),
}

impl CameraBackend {
    fn capture_into(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            CameraBackend::Synthetic(camera) => camera.capture_into(buffer),
            CameraBackend::Upstream(upstream) => upstream.capture_into(buffer),
        }
    }
}

impl CameraSource {
    /// Apply the capture configuration and bring up the backend.
    ///
    /// Failure here is terminal for bootstrap; the device restarts.
    pub fn init(config: &CameraConfig) -> Result<Self> {
        config.validate()?;

        let backend = if config.url.starts_with("stub://") {
            CameraBackend::Synthetic(SyntheticCamera::new(config)?)
        } else {
            let url = Url::parse(&config.url).context("parse camera source url")?;
            match url.scheme() {
                "http" | "https" => CameraBackend::Upstream(MjpegUpstream::new(config)?),
                other => bail!(
                    "unsupported camera source scheme '{}'; expected stub or http(s)",
                    other
                ),
            }
        };

        let (width, height) = config.frame_size.dimensions();
        log::info!(
            "camera: initialized {}x{} quality={} fb_count={} fb_location={:?} grab={:?} xclk={} Hz (d0 on pin {})",
            width,
            height,
            config.jpeg_quality,
            config.fb_count,
            config.fb_location,
            config.grab_mode,
            config.xclk_freq_hz,
            config.pins.d0,
        );

        Ok(Self {
            backend,
            pool: FramePool::new(config.fb_count),
            frames_captured: 0,
        })
    }

    /// Lease the next frame from the pool.
    ///
    /// Blocks until the backend produces a frame or reports a fault. The
    /// returned frame must be released back with `release_frame` on every
    /// exit path, or the pool starves.
    pub fn acquire_frame(&mut self) -> Result<Frame> {
        let mut buffer = self.pool.lease()?;
        if let Err(err) = self.backend.capture_into(&mut buffer) {
            self.pool.release(buffer);
            return Err(err);
        }
        self.frames_captured += 1;
        Ok(Frame {
            data: buffer,
            seq: self.frames_captured,
        })
    }

    /// Return a leased frame's buffer to the pool.
    pub fn release_frame(&mut self, frame: Frame) {
        self.pool.release(frame.into_buffer());
    }

    /// Number of frames currently leased out of the pool.
    pub fn frames_in_flight(&self) -> usize {
        self.pool.in_flight
    }

    /// Total frames captured since init.
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }
}
