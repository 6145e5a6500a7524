//! Candidate probing
//!
//! A probe runs one candidate in isolation on an auxiliary port pair and
//! measures each probe target through it. Every failure ends up in the
//! returned [`ProbeResult`]; probing never returns an error.

mod client;
mod ports;
mod result;

pub use client::{ExpectedStatus, ProbeClient, ReqwestProbeClient};
pub use ports::{AuxPortPool, PortLease};
pub use result::{median, ProbeErrorKind, ProbeResult, TargetOutcome};

use crate::config::ProbeConfig;
use crate::pool::Candidate;
use crate::tunnel::{launch_confirmed, TunnelLauncher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Runs candidates on auxiliary ports and measures them
pub struct Prober {
    launcher: Arc<dyn TunnelLauncher>,
    client: Arc<dyn ProbeClient>,
    ports: AuxPortPool,
    targets: Vec<String>,
    warmup: Duration,
    request_timeout: Duration,
    probe_timeout: Duration,
    terminate_grace: Duration,
}

impl Prober {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        client: Arc<dyn ProbeClient>,
        ports: AuxPortPool,
        config: &ProbeConfig,
    ) -> Self {
        Prober {
            launcher,
            client,
            ports,
            targets: config.targets.clone(),
            warmup: config.warmup(),
            request_timeout: config.request_timeout(),
            probe_timeout: config.probe_timeout(),
            terminate_grace: config.terminate_grace(),
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn ports(&self) -> &AuxPortPool {
        &self.ports
    }

    /// Worst-case duration of one [`probe`](Self::probe) call
    pub fn probe_budget(&self) -> Duration {
        self.warmup + self.probe_timeout + self.terminate_grace
    }

    /// Probe `candidate` on a freshly claimed auxiliary pair
    ///
    /// The lease and the tunnel are both released when this future completes
    /// or is dropped.
    pub async fn probe(&self, candidate: &Candidate) -> ProbeResult {
        let Some(lease) = self.ports.claim() else {
            warn!("No free auxiliary port pair for '{}'", candidate.id());
            return ProbeResult::unmeasured(
                candidate.id(),
                &self.targets,
                "no free auxiliary port pair",
            );
        };
        let ports = lease.ports();

        let launched =
            launch_confirmed(self.launcher.as_ref(), candidate, ports, self.warmup).await;
        let mut tunnel = match launched {
            Ok(tunnel) => tunnel,
            Err(e) => {
                debug!("Probe of '{}' could not start: {}", candidate.id(), e);
                return ProbeResult::startup_failure(candidate.id(), &self.targets, e.to_string());
            }
        };

        let result = self.measure(candidate.id(), ports.socks_connect_addr()).await;

        tunnel.terminate(self.terminate_grace).await;
        drop(lease);

        debug!(
            "Probe of '{}' on {}: {}/{} ok, score {:?}",
            candidate.id(),
            ports,
            result.successes(),
            result.outcomes.len(),
            result.score()
        );
        result
    }

    /// Request every target through an already running SOCKS listener
    ///
    /// Targets are tried in order. Each request gets the per-request timeout,
    /// cut short by the overall probe deadline; targets left without any time
    /// are recorded as timeouts.
    pub async fn measure(&self, label: &str, proxy: SocketAddr) -> ProbeResult {
        let deadline = Instant::now() + self.probe_timeout;
        let mut outcomes = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                outcomes.push(TargetOutcome::failed(target, ProbeErrorKind::Timeout));
                continue;
            }
            let budget = self.request_timeout.min(remaining);

            let outcome = match timeout(budget, self.client.fetch(proxy, target, budget)).await {
                Ok(Ok(latency)) => TargetOutcome::succeeded(target, latency),
                Ok(Err(kind)) => TargetOutcome::failed(target, kind),
                Err(_) => TargetOutcome::failed(target, ProbeErrorKind::Timeout),
            };
            debug!(
                "{} via {} -> {}: latency {:?}, error {:?}",
                label, proxy, target, outcome.latency, outcome.error
            );
            outcomes.push(outcome);
        }

        ProbeResult::new(label, outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuxiliaryConfig;
    use crate::tunnel::{port_is_free, ListenPorts, TunnelHandle};
    use crate::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_yaml::Mapping;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Handle {
        exited: bool,
        live: Arc<AtomicUsize>,
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            if !self.exited {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl TunnelHandle for Handle {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn exit_status(&mut self) -> Option<String> {
            self.exited.then(|| "exit status: 1".to_string())
        }

        async fn terminate(&mut self, _grace: Duration) {
            if !self.exited {
                self.exited = true;
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Launcher whose tunnels die immediately for ids starting with "dead"
    #[derive(Default)]
    struct Launcher {
        live: Arc<AtomicUsize>,
        seen: Mutex<Vec<ListenPorts>>,
    }

    #[async_trait]
    impl TunnelLauncher for Launcher {
        async fn launch(
            &self,
            candidate: &Candidate,
            ports: ListenPorts,
        ) -> Result<Box<dyn TunnelHandle>> {
            self.seen.lock().push(ports);
            let dead = candidate.id().starts_with("dead");
            if !dead {
                self.live.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Box::new(Handle {
                exited: dead,
                live: self.live.clone(),
            }))
        }

        async fn version(&self) -> Result<String> {
            Ok("test".into())
        }
    }

    /// Answers with a fixed latency per target, or hangs for "slow" targets
    struct Client;

    #[async_trait]
    impl ProbeClient for Client {
        async fn fetch(
            &self,
            _proxy: SocketAddr,
            target: &str,
            _timeout: Duration,
        ) -> std::result::Result<Duration, ProbeErrorKind> {
            match target {
                "http://slow.test/" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                "http://refused.test/" => Err(ProbeErrorKind::Connection),
                _ => Ok(Duration::from_millis(30)),
            }
        }
    }

    fn aux() -> AuxiliaryConfig {
        for start in (41000u16..60000).step_by(50) {
            if (start..start + 4).all(|p| port_is_free(IpAddr::V4(Ipv4Addr::LOCALHOST), p)) {
                return AuxiliaryConfig {
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port_start: start,
                    port_end: start + 3,
                };
            }
        }
        panic!("no free port block");
    }

    fn prober(launcher: Arc<Launcher>, targets: &[&str]) -> Prober {
        let config = ProbeConfig {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            warmup_ms: 1,
            request_timeout_ms: 50,
            probe_timeout_ms: 120,
            terminate_grace_ms: 1,
            ..ProbeConfig::default()
        };
        Prober::new(launcher, Arc::new(Client), AuxPortPool::new(&aux()), &config)
    }

    fn candidate(id: &str) -> Candidate {
        Candidate::new(id, format!("/etc/hysteria/{}.yaml", id), Mapping::new())
    }

    #[tokio::test]
    async fn test_probe_records_each_target() {
        let launcher = Arc::new(Launcher::default());
        let prober = prober(
            launcher.clone(),
            &["http://ok.test/", "http://refused.test/", "http://slow.test/"],
        );

        let result = prober.probe(&candidate("a")).await;

        assert_eq!(result.candidate, "a");
        assert_eq!(result.outcomes.len(), 3);
        assert!(result.outcomes[0].success());
        assert_eq!(result.outcomes[1].error, Some(ProbeErrorKind::Connection));
        assert_eq!(result.outcomes[2].error, Some(ProbeErrorKind::Timeout));
        assert_eq!(result.score(), Some(Duration::from_millis(30)));

        // tunnel terminated and lease returned
        assert_eq!(launcher.live.load(Ordering::SeqCst), 0);
        assert_eq!(prober.ports().in_use(), 0);
        let used = launcher.seen.lock()[0];
        assert_eq!(used.http, used.socks + 1);
    }

    #[tokio::test]
    async fn test_overall_deadline_marks_remaining_targets() {
        let launcher = Arc::new(Launcher::default());
        let prober = prober(
            launcher,
            &["http://slow.test/", "http://slow.test/", "http://slow.test/", "http://slow.test/"],
        );

        let started = std::time::Instant::now();
        let result = prober.measure("public", "127.0.0.1:1080".parse().unwrap()).await;

        // four 50ms budgets would need 200ms, the 120ms deadline cuts that short
        assert!(started.elapsed() < Duration::from_millis(190));
        assert_eq!(result.outcomes.len(), 4);
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.error == Some(ProbeErrorKind::Timeout)));
    }

    #[tokio::test]
    async fn test_startup_failure_is_data() {
        let launcher = Arc::new(Launcher::default());
        let prober = prober(launcher, &["http://ok.test/"]);

        let result = prober.probe(&candidate("dead-node")).await;

        assert!(result.startup_failed());
        assert!(!result.is_viable());
        assert_eq!(prober.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_probe_releases_everything() {
        let launcher = Arc::new(Launcher::default());
        let prober = prober(launcher.clone(), &["http://slow.test/"]);
        let c = candidate("a");

        let cancelled = timeout(Duration::from_millis(20), prober.probe(&c)).await;
        assert!(cancelled.is_err());

        assert_eq!(launcher.live.load(Ordering::SeqCst), 0);
        assert_eq!(prober.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_ports_leave_candidate_unmeasured() {
        let launcher = Arc::new(Launcher::default());
        let prober = prober(launcher.clone(), &["http://ok.test/"]);
        let _a = prober.ports().claim().unwrap();
        let _b = prober.ports().claim().unwrap();

        let result = prober.probe(&candidate("a")).await;
        assert!(!result.was_measured());
        assert!(!result.startup_failed());
        assert_eq!(result.outcomes[0].error, Some(ProbeErrorKind::NoPortAvailable));
        assert_eq!(result.note.as_deref(), Some("no free auxiliary port pair"));
        assert!(launcher.seen.lock().is_empty());
    }
}
