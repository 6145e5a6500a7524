//! Per-run tunnel config rendering
//!
//! The candidate mapping is copied as-is and only the listen addresses of the
//! SOCKS5 and HTTP inbounds are overwritten, so one candidate file can be run
//! on the public pair and on any auxiliary pair.

use super::ListenPorts;
use crate::pool::Candidate;
use crate::Result;
use serde_yaml::{Mapping, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Section holding the SOCKS5 inbound
pub const SOCKS_SECTION: &str = "socks5";

/// Section holding the HTTP inbound
pub const HTTP_SECTION: &str = "http";

/// Copy `params` with both inbounds listening on `ports`
pub fn render_config(params: &Mapping, ports: &ListenPorts) -> Mapping {
    let mut rendered = params.clone();
    set_listen(&mut rendered, SOCKS_SECTION, ports.socks_addr());
    set_listen(&mut rendered, HTTP_SECTION, ports.http_addr());
    rendered
}

fn set_listen(config: &mut Mapping, section: &str, addr: SocketAddr) {
    let listen = Value::from(addr.to_string());
    match config.get_mut(section) {
        Some(Value::Mapping(inbound)) => {
            inbound.insert(Value::from("listen"), listen);
        }
        _ => {
            let mut inbound = Mapping::new();
            inbound.insert(Value::from("listen"), listen);
            config.insert(Value::from(section), Value::Mapping(inbound));
        }
    }
}

/// Rendered config file on disk, removed when dropped
#[derive(Debug)]
pub struct RenderedConfig {
    path: PathBuf,
}

impl RenderedConfig {
    /// Render `candidate` for `ports` into `dir`
    pub async fn write(dir: &Path, candidate: &Candidate, ports: &ListenPorts) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}.yaml", candidate.id(), ports.socks));
        let content = serde_yaml::to_string(&render_config(candidate.params(), ports))?;
        fs::write(&path, content).await?;
        debug!("Rendered {} to {}", candidate.id(), path.display());
        Ok(RenderedConfig { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RenderedConfig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
