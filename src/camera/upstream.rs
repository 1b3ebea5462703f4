//! Upstream MJPEG backend.
//!
//! Stands in for the hardware sensor on development hosts by pulling JPEG
//! frames from another camera's HTTP endpoint. Two response shapes are
//! handled: a `multipart` MJPEG stream read incrementally, and a
//! single-shot JPEG endpoint fetched once per capture. Frames are
//! forwarded as-is, without transcoding.

use anyhow::{anyhow, Context, Result};
use std::io::Read;

use super::{CameraConfig, GrabMode};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

pub(crate) struct MjpegUpstream {
    url: String,
    grab_latest: bool,
    stream: UpstreamStream,
}

enum UpstreamStream {
    Mjpeg(MjpegReader),
    SingleShot,
}

impl MjpegUpstream {
    /// Connect to the upstream endpoint. The response content type decides
    /// whether captures read from a long-lived stream or refetch per frame.
    pub(crate) fn new(config: &CameraConfig) -> Result<Self> {
        let response = ureq::get(&config.url)
            .call()
            .with_context(|| format!("connect upstream camera {}", config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        let stream = if content_type.to_ascii_lowercase().contains("multipart") {
            UpstreamStream::Mjpeg(MjpegReader::new(response.into_reader()))
        } else {
            UpstreamStream::SingleShot
        };
        log::info!("camera: upstream source {} connected", config.url);
        Ok(Self {
            url: config.url.clone(),
            grab_latest: config.grab_mode == GrabMode::Latest,
            stream,
        })
    }

    pub(crate) fn capture_into(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.clear();
        match &mut self.stream {
            UpstreamStream::Mjpeg(reader) => reader.read_jpeg_into(buffer, self.grab_latest),
            UpstreamStream::SingleShot => fetch_snapshot_into(&self.url, buffer),
        }
    }
}

/// Incremental JPEG scanner over a multipart body.
///
/// Frames are located by their SOI/EOI markers rather than by parsing part
/// headers, which tolerates the boundary-token variations seen across
/// camera firmwares.
struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_jpeg_into(&mut self, out: &mut Vec<u8>, grab_latest: bool) -> Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((mut start, mut end)) = find_jpeg_bounds(&self.buffer) {
                if grab_latest {
                    // Drop already-buffered stale frames and hand out the
                    // most recent complete one.
                    while let Some((next_start, next_end)) = find_jpeg_bounds(&self.buffer[end..]) {
                        start = end + next_start;
                        end += next_end;
                    }
                }
                out.extend_from_slice(&self.buffer[start..end]);
                self.buffer.drain(..end);
                return Ok(());
            }

            let read = self
                .reader
                .read(&mut chunk)
                .context("read upstream mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("upstream mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            if self.buffer.len() > MAX_JPEG_BYTES {
                self.buffer.clear();
                return Err(anyhow!(
                    "upstream frame exceeded {} bytes without completing",
                    MAX_JPEG_BYTES
                ));
            }
        }
    }
}

fn fetch_snapshot_into(url: &str, out: &mut Vec<u8>) -> Result<()> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch snapshot from {}", url))?;
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(out)
        .context("read snapshot body")?;
    if out.is_empty() {
        return Err(anyhow!("upstream returned an empty snapshot"));
    }
    if out.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("upstream snapshot exceeded {} bytes", MAX_JPEG_BYTES));
    }
    Ok(())
}

/// Locate one complete JPEG (SOI through EOI, inclusive) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(payload);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn bounds_found_inside_garbage() {
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let jpeg = fake_jpeg(b"abc");
        data.extend_from_slice(&jpeg);
        data.extend_from_slice(b"\r\n");
        let (start, end) = find_jpeg_bounds(&data).unwrap();
        assert_eq!(&data[start..end], jpeg.as_slice());
    }

    #[test]
    fn bounds_absent_for_incomplete_frame() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 0x01, 0x02]).is_none());
        assert!(find_jpeg_bounds(b"no markers here").is_none());
    }

    #[test]
    fn grab_latest_skips_stale_frames() {
        let mut data = fake_jpeg(b"stale");
        data.extend_from_slice(&fake_jpeg(b"fresh"));
        let mut reader = MjpegReader::new(Box::new(Cursor::new(data)));

        let mut out = Vec::new();
        reader.read_jpeg_into(&mut out, true).unwrap();
        assert_eq!(out, fake_jpeg(b"fresh"));
    }

    #[test]
    fn fifo_grab_returns_frames_in_order() {
        let mut data = fake_jpeg(b"first");
        data.extend_from_slice(&fake_jpeg(b"second"));
        let mut reader = MjpegReader::new(Box::new(Cursor::new(data)));

        let mut out = Vec::new();
        reader.read_jpeg_into(&mut out, false).unwrap();
        assert_eq!(out, fake_jpeg(b"first"));
        out.clear();
        reader.read_jpeg_into(&mut out, false).unwrap();
        assert_eq!(out, fake_jpeg(b"second"));
    }

    #[test]
    fn ended_stream_reports_fault() {
        let mut reader = MjpegReader::new(Box::new(Cursor::new(Vec::new())));
        let mut out = Vec::new();
        assert!(reader.read_jpeg_into(&mut out, true).is_err());
    }
}
