//! HTTP stream server.
//!
//! A deliberately small HTTP responder over `std::net::TcpListener` with
//! two routes: `GET /` returns a static landing page embedding the stream,
//! and `GET /stream` takes over the connection and writes JPEG frames as a
//! `multipart/x-mixed-replace` body until the client disconnects, capture
//! faults, or shutdown is requested.
//!
//! The dispatcher is one thread; handlers run inline on it to completion,
//! so exactly one connection is serviced at a time. While a client is
//! streaming, further connections queue in the listener backlog. This is a
//! designed limitation: the device supports one active viewer.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::CameraSource;

/// Multipart boundary token; clients see it in the Content-Type header and
/// before every part.
pub const STREAM_BOUNDARY: &str = "frame";

const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the dispatcher sleeps when no connection is pending.
const DISPATCH_POLL: Duration = Duration::from_millis(20);

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:80";
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(10);

const INDEX_PAGE: &str = "<html><head><title>camstreamd</title></head>\
<body><h2>Live camera</h2><img src=\"/stream\" /></body></html>";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Socket read/write deadline per client; bounds how long a stalled
    /// peer can hold the single-threaded server.
    pub client_timeout: Duration,
    /// Pause between frames, bounding the capture rate and giving the
    /// dispatcher a chance to notice shutdown.
    pub frame_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN_ADDR.to_string(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            frame_delay: DEFAULT_FRAME_DELAY,
        }
    }
}

/// Running server handle. Dropping it leaves the server running; call
/// `stop` for an orderly shutdown.
#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StreamServer {
    cfg: ServerConfig,
    camera: Arc<Mutex<CameraSource>>,
}

impl StreamServer {
    pub fn new(cfg: ServerConfig, camera: Arc<Mutex<CameraSource>>) -> Self {
        Self { cfg, camera }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind stream server on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let camera = self.camera.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, cfg, camera, shutdown_thread) {
                log::error!("stream server stopped: {}", err);
            }
        });

        log::info!("stream server listening on {}", addr);
        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    cfg: ServerConfig,
    camera: Arc<Mutex<CameraSource>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("client {} connected", peer);
                if let Err(err) = handle_connection(stream, &cfg, &camera, &shutdown) {
                    log::warn!("client {} dropped: {}", peer, err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(DISPATCH_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ServerConfig,
    camera: &Arc<Mutex<CameraSource>>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            // Malformed or absent request: drop the connection silently.
            log::debug!("unreadable request: {}", err);
            return Ok(());
        }
    };

    if request.method != "GET" {
        return write_simple_response(&mut stream, 405, "text/plain", b"method not allowed");
    }
    match request.path.as_str() {
        "/" => write_simple_response(&mut stream, 200, "text/html", INDEX_PAGE.as_bytes()),
        "/stream" => stream_frames(stream, cfg, camera, shutdown),
        _ => write_simple_response(&mut stream, 404, "text/plain", b"not found"),
    }
}

/// The streaming loop. Owns the connection until it ends; never returns a
/// payload to the dispatcher.
fn stream_frames(
    mut stream: TcpStream,
    cfg: &ServerConfig,
    camera: &Arc<Mutex<CameraSource>>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_read_timeout(Some(cfg.client_timeout))?;
    stream.set_write_timeout(Some(cfg.client_timeout))?;

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream
        .write_all(header.as_bytes())
        .context("write stream headers")?;

    let mut parts_written = 0u64;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let write_result = {
            let mut source = camera
                .lock()
                .map_err(|_| anyhow!("camera mutex poisoned"))?;
            let frame = match source.acquire_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("capture fault, ending stream: {}", err);
                    break;
                }
            };
            let result = write_frame_part(&mut stream, STREAM_BOUNDARY, frame.bytes());
            // Release must not depend on write success.
            source.release_frame(frame);
            result
        };

        if let Err(err) = write_result {
            log::debug!("stream write failed: {}", err);
            break;
        }
        parts_written += 1;

        if !connection_open(&mut stream) {
            break;
        }
        std::thread::sleep(cfg.frame_delay);
    }

    log::debug!("stream ended after {} parts", parts_written);
    Ok(())
}

/// Write one multipart part: boundary marker, part headers, JPEG payload,
/// and the trailing CRLF.
fn write_frame_part(writer: &mut impl Write, boundary: &str, jpeg: &[u8]) -> std::io::Result<()> {
    write!(
        writer,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        jpeg.len()
    )?;
    writer.write_all(jpeg)?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

/// Poll the connection's open status without consuming stream data the
/// client may still send. An orderly EOF from the peer reads as closed;
/// anything readable or a would-block reads as open.
fn connection_open(stream: &mut TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let open = match stream.read(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) if err.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    if stream.set_nonblocking(false).is_err() {
        return false;
    }
    open
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

fn read_request<R: Read>(reader: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_simple_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
