//! Layered daemon configuration.
//!
//! Precedence, lowest to highest: built-in defaults, optional TOML file
//! (named by `CAMSTREAM_CONFIG` or `--config`), environment overrides.
//! The result is a set of immutable component configs handed to the init
//! calls at bootstrap; there is no runtime reconfiguration surface.

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::camera::{CameraConfig, FbLocation, FrameSize, GrabMode};
use crate::link::LinkConfig;
use crate::server::ServerConfig;

const DEFAULT_INFERENCE_HOST: &str = "192.168.0.100";
const DEFAULT_INFERENCE_PORT: u16 = 8000;
const DEFAULT_INFERENCE_PATH: &str = "/infer";

const DEFAULT_AUDIO_BCLK_PIN: u8 = 14;
const DEFAULT_AUDIO_LRCLK_PIN: u8 = 15;
const DEFAULT_AUDIO_DOUT_PIN: u8 = 13;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    wifi: Option<WifiSection>,
    camera: Option<CameraSection>,
    http: Option<HttpSection>,
    inference: Option<InferenceSection>,
    audio: Option<AudioSection>,
}

#[derive(Debug, Deserialize, Default)]
struct WifiSection {
    ssid: Option<String>,
    password: Option<String>,
    timeout_ms: Option<u64>,
    poll_ms: Option<u64>,
    driver: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraSection {
    url: Option<String>,
    frame_size: Option<String>,
    jpeg_quality: Option<u8>,
    fb_count: Option<usize>,
    fb_location: Option<String>,
    grab_mode: Option<String>,
    xclk_freq_hz: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpSection {
    addr: Option<String>,
    client_timeout_ms: Option<u64>,
    frame_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceSection {
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AudioSection {
    bclk_pin: Option<u8>,
    lrclk_pin: Option<u8>,
    dout_pin: Option<u8>,
}

/// Inference service endpoint. Declared for the external inference client;
/// nothing in this daemon consumes it.
#[derive(Clone, Debug)]
pub struct InferenceSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Audio output pin assignment. Declared for the external playback module;
/// nothing in this daemon consumes it.
#[derive(Clone, Debug)]
pub struct AudioSettings {
    pub bclk_pin: u8,
    pub lrclk_pin: u8,
    pub dout_pin: u8,
}

#[derive(Clone, Debug)]
pub struct CamstreamdConfig {
    pub wifi: LinkConfig,
    pub camera: CameraConfig,
    pub http: ServerConfig,
    pub inference: InferenceSettings,
    pub audio: AudioSettings,
}

impl CamstreamdConfig {
    /// Load configuration using the `CAMSTREAM_CONFIG` environment variable
    /// to locate an optional config file.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load configuration from an explicit file path (or defaults when
    /// `None`), then apply environment overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let mut wifi = LinkConfig::default();
        if let Some(section) = file.wifi {
            if let Some(ssid) = section.ssid {
                wifi.ssid = ssid;
            }
            if let Some(password) = section.password {
                wifi.password = password;
            }
            if let Some(timeout_ms) = section.timeout_ms {
                wifi.timeout = Duration::from_millis(timeout_ms);
            }
            if let Some(poll_ms) = section.poll_ms {
                wifi.poll_interval = Duration::from_millis(poll_ms);
            }
            if let Some(driver) = section.driver {
                wifi.driver = driver;
            }
        }

        let mut camera = CameraConfig::default();
        if let Some(section) = file.camera {
            if let Some(url) = section.url {
                camera.url = url;
            }
            if let Some(name) = section.frame_size {
                camera.frame_size = FrameSize::from_name(&name)?;
            }
            if let Some(quality) = section.jpeg_quality {
                camera.jpeg_quality = quality;
            }
            if let Some(fb_count) = section.fb_count {
                camera.fb_count = fb_count;
            }
            if let Some(name) = section.fb_location {
                camera.fb_location = FbLocation::from_name(&name)?;
            }
            if let Some(name) = section.grab_mode {
                camera.grab_mode = GrabMode::from_name(&name)?;
            }
            if let Some(xclk) = section.xclk_freq_hz {
                camera.xclk_freq_hz = xclk;
            }
        }

        let mut http = ServerConfig::default();
        if let Some(section) = file.http {
            if let Some(addr) = section.addr {
                http.addr = addr;
            }
            if let Some(timeout_ms) = section.client_timeout_ms {
                http.client_timeout = Duration::from_millis(timeout_ms);
            }
            if let Some(delay_ms) = section.frame_delay_ms {
                http.frame_delay = Duration::from_millis(delay_ms);
            }
        }

        let inference = InferenceSettings {
            host: file
                .inference
                .as_ref()
                .and_then(|section| section.host.clone())
                .unwrap_or_else(|| DEFAULT_INFERENCE_HOST.to_string()),
            port: file
                .inference
                .as_ref()
                .and_then(|section| section.port)
                .unwrap_or(DEFAULT_INFERENCE_PORT),
            path: file
                .inference
                .and_then(|section| section.path)
                .unwrap_or_else(|| DEFAULT_INFERENCE_PATH.to_string()),
        };

        let audio = AudioSettings {
            bclk_pin: file
                .audio
                .as_ref()
                .and_then(|section| section.bclk_pin)
                .unwrap_or(DEFAULT_AUDIO_BCLK_PIN),
            lrclk_pin: file
                .audio
                .as_ref()
                .and_then(|section| section.lrclk_pin)
                .unwrap_or(DEFAULT_AUDIO_LRCLK_PIN),
            dout_pin: file
                .audio
                .and_then(|section| section.dout_pin)
                .unwrap_or(DEFAULT_AUDIO_DOUT_PIN),
        };

        Ok(Self {
            wifi,
            camera,
            http,
            inference,
            audio,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(ssid) = std::env::var("CAMSTREAM_WIFI_SSID") {
            if !ssid.trim().is_empty() {
                self.wifi.ssid = ssid;
            }
        }
        if let Ok(password) = std::env::var("CAMSTREAM_WIFI_PASSWORD") {
            if !password.is_empty() {
                self.wifi.password = password;
            }
        }
        if let Ok(driver) = std::env::var("CAMSTREAM_LINK_DRIVER") {
            if !driver.trim().is_empty() {
                self.wifi.driver = driver;
            }
        }
        if let Ok(addr) = std::env::var("CAMSTREAM_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http.addr = addr;
            }
        }
        if let Ok(url) = std::env::var("CAMSTREAM_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.http
            .addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("invalid http listen address '{}'", self.http.addr))?;
        if self.wifi.poll_interval > self.wifi.timeout {
            bail!("wifi poll interval exceeds the association timeout");
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
