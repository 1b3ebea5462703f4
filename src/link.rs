//! Wireless link management.
//!
//! `WirelessLink` owns the association lifecycle for the device's single
//! network link: it starts association, polls the link status at a fixed
//! interval, and gives up once the configured timeout is reached. Retry
//! policy belongs to the caller; bootstrap treats a failed `connect` as
//! fatal and restarts the device.
//!
//! Two drivers are available, selected by `LinkConfig::driver`:
//! - `host`: association is delegated to the operating system; the driver
//!   only verifies that a routable, non-loopback address is assigned.
//! - `stub`, `stub:down`, `stub:<n>`: synthetic driver for tests that
//!   associates immediately, never, or after `n` status polls.

use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Address the host driver routes toward to discover the local address.
/// No packets are sent; `UdpSocket::connect` only performs a route lookup.
const PROBE_ADDR: &str = "8.8.8.8:53";

const STUB_LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 42));

/// Configuration for the wireless link.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Network name. Informational for the `host` driver, which relies on
    /// the operating system's own credential store.
    pub ssid: String,
    pub password: String,
    /// Total time to wait for association before giving up.
    pub timeout: Duration,
    /// Interval between link status polls.
    pub poll_interval: Duration,
    /// Driver selector: `host`, `stub`, `stub:down`, or `stub:<n>`.
    pub driver: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            driver: "host".to_string(),
        }
    }
}

/// Association state of the device's single wireless link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// The device's wireless link.
pub struct WirelessLink {
    config: LinkConfig,
    state: LinkState,
    backend: LinkBackend,
}

enum LinkBackend {
    Host(HostLink),
    Stub(StubLink),
}

impl WirelessLink {
    pub fn new(config: LinkConfig) -> Result<Self> {
        let backend = match config.driver.as_str() {
            "host" => LinkBackend::Host(HostLink),
            driver if driver == "stub" || driver.starts_with("stub:") => {
                LinkBackend::Stub(StubLink::from_driver(driver)?)
            }
            other => return Err(anyhow!("unknown link driver '{}'", other)),
        };
        Ok(Self {
            config,
            state: LinkState::Disconnected,
            backend,
        })
    }

    /// Associate with the configured network.
    ///
    /// Polls the link status every `poll_interval` and returns an error once
    /// the accumulated wait reaches `timeout` without association. Performs
    /// no retries of its own.
    pub fn connect(&mut self) -> Result<()> {
        self.state = LinkState::Connecting;
        if self.config.ssid.is_empty() {
            log::info!("wifi: waiting for association ({} driver)", self.config.driver);
        } else {
            log::info!("wifi: connecting to '{}'", self.config.ssid);
        }

        let start = Instant::now();
        loop {
            if self.backend.is_associated() {
                self.state = LinkState::Connected;
                match self.local_ip() {
                    Some(ip) => log::info!("wifi: connected, address {}", ip),
                    None => log::info!("wifi: connected"),
                }
                return Ok(());
            }
            if start.elapsed() >= self.config.timeout {
                self.state = LinkState::Disconnected;
                return Err(anyhow!(
                    "wifi association timed out after {} ms",
                    self.config.timeout.as_millis()
                ));
            }
            log::debug!("wifi: not associated yet");
            std::thread::sleep(self.config.poll_interval);
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The link's assigned address once connected. Observational only; the
    /// streaming pipeline does not consume it.
    pub fn local_ip(&self) -> Option<IpAddr> {
        if self.state != LinkState::Connected {
            return None;
        }
        match &self.backend {
            LinkBackend::Host(_) => probe_local_ip(),
            LinkBackend::Stub(_) => Some(STUB_LOCAL_IP),
        }
    }
}

struct HostLink;

impl HostLink {
    fn is_associated(&self) -> bool {
        probe_local_ip().is_some()
    }
}

struct StubLink {
    /// `None` never associates; `Some(n)` associates on the nth poll.
    polls_until_up: Option<u32>,
    polls_seen: u32,
}

impl StubLink {
    fn from_driver(driver: &str) -> Result<Self> {
        let polls_until_up = match driver.split_once(':') {
            None => Some(0),
            Some((_, "down")) => None,
            Some((_, count)) => Some(
                count
                    .parse()
                    .map_err(|_| anyhow!("invalid stub link driver '{}'", driver))?,
            ),
        };
        Ok(Self {
            polls_until_up,
            polls_seen: 0,
        })
    }

    fn is_associated(&mut self) -> bool {
        let up = match self.polls_until_up {
            Some(required) => self.polls_seen >= required,
            None => false,
        };
        self.polls_seen += 1;
        up
    }
}

impl LinkBackend {
    fn is_associated(&mut self) -> bool {
        match self {
            LinkBackend::Host(host) => host.is_associated(),
            LinkBackend::Stub(stub) => stub.is_associated(),
        }
    }
}

fn probe_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(PROBE_ADDR).ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_loopback() || addr.ip().is_unspecified() {
        return None;
    }
    Some(addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(driver: &str) -> LinkConfig {
        LinkConfig {
            ssid: "testnet".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
            driver: driver.to_string(),
        }
    }

    #[test]
    fn stub_link_connects_immediately() {
        let mut link = WirelessLink::new(stub_config("stub")).unwrap();
        assert_eq!(link.state(), LinkState::Disconnected);
        link.connect().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.local_ip(), Some(STUB_LOCAL_IP));
    }

    #[test]
    fn stub_link_connects_after_polls() {
        let mut link = WirelessLink::new(stub_config("stub:3")).unwrap();
        link.connect().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn down_link_times_out() {
        let mut link = WirelessLink::new(stub_config("stub:down")).unwrap();
        let start = Instant::now();
        let err = link.connect().unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.local_ip().is_none());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn unknown_driver_is_rejected() {
        assert!(WirelessLink::new(stub_config("esp32")).is_err());
    }

    #[test]
    fn malformed_stub_driver_is_rejected() {
        assert!(WirelessLink::new(stub_config("stub:soon")).is_err());
    }
}
