//! Synthetic sensor backend.
//!
//! Renders a moving test pattern and encodes it as a real JPEG with the
//! configured sensor quality, so the rest of the pipeline exercises the
//! same byte-level contract as a hardware sensor. `stub://…?fault-after=<n>`
//! makes the sensor report a hardware fault after `n` captures.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use rand::Rng;

use super::CameraConfig;

pub(crate) struct SyntheticCamera {
    width: u32,
    height: u32,
    jpeg_quality: u8,
    fault_after: Option<u64>,
    frame_count: u64,
}

impl SyntheticCamera {
    pub(crate) fn new(config: &CameraConfig) -> Result<Self> {
        let (width, height) = config.frame_size.dimensions();
        Ok(Self {
            width,
            height,
            jpeg_quality: config.jpeg_quality,
            fault_after: parse_fault_after(&config.url)?,
            frame_count: 0,
        })
    }

    pub(crate) fn capture_into(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        if let Some(limit) = self.fault_after {
            if self.frame_count >= limit {
                return Err(anyhow!("sensor fault injected after {} frames", limit));
            }
        }
        self.frame_count += 1;

        let raw = self.render();
        buffer.clear();
        let encoder = JpegEncoder::new_with_quality(&mut *buffer, encoder_quality(self.jpeg_quality));
        encoder
            .write_image(&raw, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode synthetic frame")?;
        Ok(())
    }

    /// Diagonal gradient that drifts with the frame count, plus mild sensor
    /// noise so consecutive frames never byte-compare equal.
    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let phase = (self.frame_count * 7) as usize;
        let mut rng = rand::thread_rng();

        let mut raw = vec![0u8; width * height * 3];
        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) * 3;
                raw[i] = ((x + phase) % 256) as u8;
                raw[i + 1] = ((y + phase / 2) % 256) as u8;
                raw[i + 2] = (((x + y) / 2 + phase) % 256) as u8;
            }
        }
        for _ in 0..width {
            let i = rng.gen_range(0..raw.len());
            raw[i] = raw[i].wrapping_add(rng.gen_range(1..8));
        }
        raw
    }
}

/// Map the sensor quality scale (0 best, 63 worst) onto the encoder's
/// (100 best, 1 worst).
fn encoder_quality(sensor_quality: u8) -> u8 {
    let scaled = 100u16.saturating_sub(sensor_quality as u16 * 99 / 63);
    scaled.max(1) as u8
}

fn parse_fault_after(url: &str) -> Result<Option<u64>> {
    let Some((_, query)) = url.split_once('?') else {
        return Ok(None);
    };
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "fault-after" {
                let limit = value
                    .parse()
                    .map_err(|_| anyhow!("invalid fault-after value '{}'", value))?;
                return Ok(Some(limit));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_quality_maps_sensor_scale() {
        assert_eq!(encoder_quality(0), 100);
        assert_eq!(encoder_quality(63), 1);
        assert!(encoder_quality(12) > encoder_quality(40));
    }

    #[test]
    fn fault_after_parses_from_query() {
        assert_eq!(parse_fault_after("stub://sensor").unwrap(), None);
        assert_eq!(
            parse_fault_after("stub://sensor?fault-after=3").unwrap(),
            Some(3)
        );
        assert!(parse_fault_after("stub://sensor?fault-after=soon").is_err());
    }

    #[test]
    fn consecutive_frames_differ() {
        let config = CameraConfig {
            url: "stub://sensor".to_string(),
            frame_size: crate::camera::FrameSize::Qvga,
            ..CameraConfig::default()
        };
        let mut camera = SyntheticCamera::new(&config).unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        camera.capture_into(&mut first).unwrap();
        camera.capture_into(&mut second).unwrap();
        assert_ne!(first, second);
    }
}
