//! Tunnel process seam
//!
//! Everything that touches the external tunnel binary sits behind
//! [`TunnelLauncher`] and [`TunnelHandle`]: rendering a per-run config with
//! the requested listen ports, spawning the process, and terminating it.
//! Prober and Supervisor only talk to these traits.

mod process;
mod render;

pub use process::{BinaryLauncher, ChildTunnel, VERSION_QUERY_TIMEOUT};
pub use render::{render_config, RenderedConfig, HTTP_SECTION, SOCKS_SECTION};

use crate::pool::Candidate;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// SOCKS + HTTP listen pair for one tunnel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenPorts {
    pub host: IpAddr,
    pub socks: u16,
    pub http: u16,
}

impl ListenPorts {
    pub fn new(host: IpAddr, socks: u16, http: u16) -> Self {
        ListenPorts { host, socks, http }
    }

    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.socks)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.http)
    }

    /// Address a local client dials to reach the SOCKS listener
    ///
    /// Wildcard listen hosts are reached through loopback.
    pub fn socks_connect_addr(&self) -> SocketAddr {
        let host = match self.host {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            other => other,
        };
        SocketAddr::new(host, self.socks)
    }

    /// Fail if either port is currently taken by another listener
    pub fn ensure_bindable(&self) -> std::result::Result<(), String> {
        for addr in [self.socks_addr(), self.http_addr()] {
            TcpListener::bind(addr).map_err(|e| format!("{} is not bindable: {}", addr, e))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ListenPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socks={} http={}", self.socks_addr(), self.http_addr())
    }
}

/// True when nothing is listening on `host:port` right now
pub fn port_is_free(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

/// A live tunnel instance
#[async_trait]
pub trait TunnelHandle: Send {
    /// OS process id, if there is one
    fn pid(&self) -> Option<u32>;

    /// Description of the exit status once the tunnel has exited
    fn exit_status(&mut self) -> Option<String>;

    /// Graceful termination, forced after `grace`
    async fn terminate(&mut self, grace: Duration);
}

/// Starts tunnel instances for candidates
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Spawn a tunnel for `candidate` listening on `ports`
    async fn launch(&self, candidate: &Candidate, ports: ListenPorts)
        -> Result<Box<dyn TunnelHandle>>;

    /// Version string of the tunnel implementation, used as a startup sanity check
    async fn version(&self) -> Result<String>;
}

/// Launch a tunnel and require it to survive `grace`
///
/// Any failure is reported as [`Error::StartupFailure`] for the candidate.
pub async fn launch_confirmed(
    launcher: &dyn TunnelLauncher,
    candidate: &Candidate,
    ports: ListenPorts,
    grace: Duration,
) -> Result<Box<dyn TunnelHandle>> {
    let mut handle = launcher
        .launch(candidate, ports)
        .await
        .map_err(|e| Error::startup(candidate.id(), e.to_string()))?;

    debug!(
        "Tunnel for '{}' spawned (pid {:?}) on {}",
        candidate.id(),
        handle.pid(),
        ports
    );

    sleep(grace).await;

    if let Some(status) = handle.exit_status() {
        return Err(Error::startup(
            candidate.id(),
            format!("exited within {}ms ({})", grace.as_millis(), status),
        ));
    }

    Ok(handle)
}
