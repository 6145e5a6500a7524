//! Tunnel binary process management
//!
//! Spawns the external tunnel binary against a rendered config and stops it
//! with SIGTERM, falling back to a kill once the grace period runs out.

use super::render::RenderedConfig;
use super::{ListenPorts, TunnelHandle, TunnelLauncher};
use crate::pool::Candidate;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Upper bound for the startup version query
pub const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Launches the real tunnel binary
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    executable: PathBuf,
    runtime_dir: PathBuf,
    version_timeout: Duration,
}

impl BinaryLauncher {
    pub fn new(executable: PathBuf, runtime_dir: PathBuf) -> Self {
        BinaryLauncher {
            executable,
            runtime_dir,
            version_timeout: VERSION_QUERY_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_version_timeout(mut self, limit: Duration) -> Self {
        self.version_timeout = limit;
        self
    }
}

#[async_trait]
impl TunnelLauncher for BinaryLauncher {
    async fn launch(
        &self,
        candidate: &Candidate,
        ports: ListenPorts,
    ) -> Result<Box<dyn TunnelHandle>> {
        let config = RenderedConfig::write(&self.runtime_dir, candidate, &ports).await?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("-c")
            .arg(config.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Spawning {:?} -c {:?} for '{}'",
            self.executable,
            config.path(),
            candidate.id()
        );

        let mut child = cmd.spawn().map_err(|e| {
            Error::binary(format!("failed to spawn {:?}: {}", self.executable, e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, candidate.id().to_string(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, candidate.id().to_string(), "stderr");
        }

        Ok(Box::new(ChildTunnel {
            candidate: candidate.id().to_string(),
            child,
            _config: config,
        }))
    }

    async fn version(&self) -> Result<String> {
        let query = Command::new(&self.executable)
            .arg("version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.version_timeout, query)
            .await
            .inspect_err(|_| warn!("{:?} version query timed out", self.executable))?
            .map_err(|e| Error::binary(format!("cannot execute {:?}: {}", self.executable, e)))?;

        if !output.status.success() {
            return Err(Error::binary(format!(
                "{:?} version exited with {}",
                self.executable, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("unknown")
            .to_string())
    }
}

/// Relay child output into the log, one event per line
fn forward_output<R>(reader: R, candidate: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(candidate = %candidate, stream, "{}", line);
        }
    });
}

/// A running tunnel binary
///
/// Dropping the handle kills the process and removes its rendered config.
pub struct ChildTunnel {
    candidate: String,
    child: Child,
    _config: RenderedConfig,
}

#[async_trait]
impl TunnelHandle for ChildTunnel {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(status.to_string()),
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.exit_status().is_some() {
            return;
        }

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Tunnel '{}' exited with status: {}", self.candidate, status);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for tunnel '{}': {}", self.candidate, e);
            }
            Err(_) => {
                info!(
                    "Tunnel '{}' ignored SIGTERM for {}ms, killing",
                    self.candidate,
                    grace.as_millis()
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;
    use std::net::{IpAddr, Ipv4Addr};

    fn ports() -> ListenPorts {
        ListenPorts::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 21090, 21091)
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = BinaryLauncher::new(
            PathBuf::from("/nonexistent/hysteria"),
            dir.path().to_path_buf(),
        );
        let candidate = Candidate::new("node", "/etc/hysteria/node.yaml", Mapping::new());

        let result = launcher.launch(&candidate, ports()).await;
        assert!(matches!(result, Err(Error::Binary(_))));
        // rendered config is cleaned up with the failed launch
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_version_missing_executable() {
        let launcher = BinaryLauncher::new(
            PathBuf::from("/nonexistent/hysteria"),
            std::env::temp_dir(),
        );
        assert!(matches!(launcher.version().await, Err(Error::Binary(_))));
    }

    /// Stand-in binary that ignores its arguments and sleeps
    #[cfg(unix)]
    fn sleeper(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-tunnel.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_query_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = BinaryLauncher::new(sleeper(dir.path()), dir.path().join("run"))
            .with_version_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = launcher.version().await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = sleeper(dir.path());

        let launcher = BinaryLauncher::new(script, dir.path().join("run"));
        let candidate = Candidate::new("node", "/etc/hysteria/node.yaml", Mapping::new());
        let mut handle = launcher.launch(&candidate, ports()).await.unwrap();

        assert!(handle.pid().is_some());
        assert!(handle.exit_status().is_none());

        handle.terminate(Duration::from_secs(2)).await;
        assert!(handle.exit_status().is_some());
    }
}
