use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camstreamd::camera::{CameraConfig, CameraSource, FrameSize};
use camstreamd::server::{ServerConfig, ServerHandle, StreamServer};

fn test_camera_config(url: &str) -> CameraConfig {
    CameraConfig {
        url: url.to_string(),
        frame_size: FrameSize::Qvga,
        ..CameraConfig::default()
    }
}

fn spawn_server(camera_url: &str) -> (ServerHandle, Arc<Mutex<CameraSource>>) {
    let source = CameraSource::init(&test_camera_config(camera_url)).expect("camera init");
    let camera = Arc::new(Mutex::new(source));
    let server = StreamServer::new(
        ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            client_timeout: Duration::from_secs(2),
            frame_delay: Duration::from_millis(1),
        },
        camera.clone(),
    );
    let handle = server.spawn().expect("spawn server");
    (handle, camera)
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

fn http_get(handle: &ServerHandle, path: &str) -> String {
    let mut stream = connect(handle);
    write!(stream, "GET {} HTTP/1.1\r\nHost: cam\r\n\r\n", path).expect("send request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    response
}

fn read_stream_headers(reader: &mut impl BufRead) -> Vec<String> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read header line");
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        headers.push(line);
    }
    headers
}

/// Read one multipart part; `None` on end of stream. Asserts the framing
/// invariants on every part it reads.
fn read_part(reader: &mut impl BufRead) -> Option<Vec<u8>> {
    let mut boundary = String::new();
    if reader.read_line(&mut boundary).expect("read boundary") == 0 {
        return None;
    }
    assert_eq!(boundary.trim_end(), "--frame");

    let mut content_type = String::new();
    reader.read_line(&mut content_type).expect("read part type");
    assert_eq!(content_type.trim_end(), "Content-Type: image/jpeg");

    let mut content_length = String::new();
    reader
        .read_line(&mut content_length)
        .expect("read part length");
    let declared: usize = content_length
        .trim_end()
        .strip_prefix("Content-Length: ")
        .expect("length header")
        .parse()
        .expect("numeric length");

    let mut blank = String::new();
    reader.read_line(&mut blank).expect("read blank line");
    assert_eq!(blank, "\r\n");

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).expect("read payload");

    let mut trailer = String::new();
    reader.read_line(&mut trailer).expect("read part trailer");
    assert_eq!(trailer, "\r\n");

    Some(payload)
}

fn wait_for_idle_pool(camera: &Arc<Mutex<CameraSource>>) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if camera.lock().unwrap().frames_in_flight() == 0 {
            return;
        }
        if Instant::now() > deadline {
            panic!("frame pool never drained");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn index_page_is_static_and_links_the_stream() {
    // A camera that faults on the very first acquire must not affect the
    // landing page.
    let (handle, _camera) = spawn_server("stub://sensor?fault-after=0");

    let response = http_get(&handle, "/");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/html"));
    assert!(response.contains("/stream"));

    handle.stop().expect("stop server");
}

#[test]
fn unknown_route_is_not_found() {
    let (handle, _camera) = spawn_server("stub://sensor");

    let response = http_get(&handle, "/snapshot");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    handle.stop().expect("stop server");
}

#[test]
fn non_get_method_is_rejected() {
    let (handle, _camera) = spawn_server("stub://sensor");

    let mut stream = connect(&handle);
    write!(stream, "POST / HTTP/1.1\r\nHost: cam\r\n\r\n").expect("send request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));

    handle.stop().expect("stop server");
}

#[test]
fn stream_parts_declare_exact_payload_length() {
    let (handle, camera) = spawn_server("stub://sensor");

    let mut stream = connect(&handle);
    write!(stream, "GET /stream HTTP/1.1\r\nHost: cam\r\n\r\n").expect("send request");
    let mut reader = BufReader::new(stream);

    let headers = read_stream_headers(&mut reader);
    assert_eq!(headers[0], "HTTP/1.1 200 OK");
    assert!(headers
        .contains(&"Content-Type: multipart/x-mixed-replace; boundary=frame".to_string()));
    assert!(headers.contains(&"Connection: close".to_string()));

    for _ in 0..3 {
        let payload = read_part(&mut reader).expect("stream part");
        // read_part already checked declared length == payload length; the
        // payload itself must be a complete JPEG.
        assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        assert_eq!(&payload[payload.len() - 2..], &[0xFF, 0xD9]);
    }

    drop(reader);
    wait_for_idle_pool(&camera);
    handle.stop().expect("stop server");
}

#[test]
fn capture_fault_ends_the_stream() {
    let (handle, camera) = spawn_server("stub://sensor?fault-after=3");

    let mut stream = connect(&handle);
    write!(stream, "GET /stream HTTP/1.1\r\nHost: cam\r\n\r\n").expect("send request");
    let mut reader = BufReader::new(stream);

    let headers = read_stream_headers(&mut reader);
    assert_eq!(headers[0], "HTTP/1.1 200 OK");

    let mut parts = 0;
    while read_part(&mut reader).is_some() {
        parts += 1;
    }
    assert_eq!(parts, 3);

    wait_for_idle_pool(&camera);
    assert_eq!(camera.lock().unwrap().frames_captured(), 3);
    handle.stop().expect("stop server");
}

#[test]
fn client_disconnect_frees_the_server() {
    let (handle, camera) = spawn_server("stub://sensor");

    let mut stream = connect(&handle);
    write!(stream, "GET /stream HTTP/1.1\r\nHost: cam\r\n\r\n").expect("send request");
    let mut reader = BufReader::new(stream);
    read_stream_headers(&mut reader);
    let first = read_part(&mut reader).expect("first part");
    assert!(!first.is_empty());
    drop(reader);

    // The streaming loop must notice the disconnect, return the pool to
    // balance, and leave the server accepting new connections.
    wait_for_idle_pool(&camera);
    let response = http_get(&handle, "/");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    handle.stop().expect("stop server");
}
