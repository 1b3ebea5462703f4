//! camstreamd - standalone network camera daemon
//!
//! Bootstrap order:
//! 1. Load layered configuration (file, env, CLI flags)
//! 2. Initialize the camera capture source
//! 3. Bring up / verify the wireless link
//! 4. Serve the landing page and the MJPEG stream over HTTP
//!
//! Camera init failure and wifi association timeout are bootstrap-fatal:
//! the daemon logs the error, waits a fixed delay, and restarts the whole
//! process. Mid-stream faults never reach this level; they end only the
//! affected connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camstreamd::camera::CameraSource;
use camstreamd::config::CamstreamdConfig;
use camstreamd::link::WirelessLink;
use camstreamd::server::StreamServer;

const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Standalone MJPEG network camera daemon")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override, e.g. 0.0.0.0:8080.
    #[arg(long)]
    listen: Option<String>,

    /// Camera source URL override (stub://… or http://…).
    #[arg(long)]
    camera: Option<String>,

    /// Wireless driver override (host, stub, stub:down).
    #[arg(long)]
    link_driver: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(err) = run(args) {
        log::error!("fatal: {:#}", err);
        log::error!("restarting in {} ms", RESTART_DELAY.as_millis());
        std::thread::sleep(RESTART_DELAY);
        restart_process();
    }
}

fn run(args: Args) -> Result<()> {
    let mut cfg = CamstreamdConfig::load_from(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.http.addr = listen;
    }
    if let Some(camera) = args.camera {
        cfg.camera.url = camera;
    }
    if let Some(driver) = args.link_driver {
        cfg.wifi.driver = driver;
    }
    cfg.validate()?;

    log::info!("camstreamd {} starting", env!("CARGO_PKG_VERSION"));

    let camera = CameraSource::init(&cfg.camera)?;
    let mut link = WirelessLink::new(cfg.wifi.clone())?;
    link.connect()?;

    let camera = Arc::new(Mutex::new(camera));
    let handle = StreamServer::new(cfg.http.clone(), camera).spawn()?;
    match link.local_ip() {
        Some(ip) => log::info!(
            "open http://{}:{}/ to view the stream",
            ip,
            handle.addr.port()
        ),
        None => log::info!("open http://{}/ to view the stream", handle.addr),
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .context("install shutdown handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutdown requested");
    handle.stop()?;
    Ok(())
}

/// The process-level analogue of a device reset: replace this process with
/// a fresh instance of the same binary and arguments.
fn restart_process() -> ! {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if let Ok(exe) = std::env::current_exe() {
            let err = std::process::Command::new(exe)
                .args(std::env::args_os().skip(1))
                .exec();
            log::error!("re-exec failed: {}", err);
        }
    }
    std::process::exit(1);
}
