//! camstreamd - standalone MJPEG network camera daemon
//!
//! This crate turns a camera-equipped device into a network video source:
//! it verifies the wireless link, initializes a JPEG capture source, and
//! serves a continuous motion-JPEG stream plus a small landing page over
//! HTTP.
//!
//! # Module Structure
//!
//! - `link`: wireless association state machine and timeout policy
//! - `camera`: capture source, frame pool, and frame lease lifecycle
//! - `server`: HTTP responder with the multipart streaming loop
//! - `config`: layered daemon configuration (file, env, defaults)
//!
//! The pipeline holds at most one frame in flight: a frame leased from the
//! camera pool is written to the client and released before the next
//! acquire. One connection streams at a time; additional clients wait until
//! the active stream ends.

pub mod camera;
pub mod config;
pub mod link;
pub mod server;

pub use camera::{
    CameraConfig, CameraPins, CameraSource, FbLocation, Frame, FrameSize, GrabMode, PixelFormat,
};
pub use config::{AudioSettings, CamstreamdConfig, InferenceSettings};
pub use link::{LinkConfig, LinkState, WirelessLink};
pub use server::{ServerConfig, ServerHandle, StreamServer};
