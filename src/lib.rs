//! Tunnel Pilot - adaptive selection and supervision of proxy tunnels
//!
//! Keeps the best-performing tunnel configuration out of a pool of candidates
//! bound to a fixed client-facing SOCKS/HTTP endpoint:
//! - concurrent latency probing of every candidate on auxiliary ports
//! - deterministic ranking
//! - non-overlapping hot-swap of the live tunnel process
//! - periodic cheap checks with degradation-triggered full re-evaluation
//!
//! # Architecture
//!
//! ```text
//!                  +------------------+
//!                  |   controller/    |
//!                  |  (periodic loop) |
//!                  +----+--------+----+
//!                       |        |
//!             +---------v--+  +--v-----------+     +--------+
//!             |  select/   |  | supervisor/  |<----+  hub/  |
//!             | (rounds)   |  | (live tunnel)|     | (API)  |
//!             +-----+------+  +------+-------+     +--------+
//!                   |                |
//!             +-----v------+         |
//!             |  probe/    |         |
//!             | (aux ports)|         |
//!             +-----+------+         |
//!                   |                |
//!             +-----v----------------v-----+
//!             |          tunnel/           |
//!             | (render, spawn, terminate) |
//!             +----------------------------+
//! ```

pub mod common;
pub mod config;
pub mod controller;
pub mod hub;
pub mod pool;
pub mod probe;
pub mod select;
pub mod supervisor;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Settings;

use controller::Controller;
use pool::CandidatePool;
use probe::{AuxPortPool, ExpectedStatus, ProbeClient, Prober, ReqwestProbeClient};
use select::{Evaluation, Selector};
use std::net::SocketAddr;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunnel::{BinaryLauncher, TunnelLauncher};

/// Tunnel Pilot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run options that only come from the command line
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Start this candidate directly instead of evaluating first
    pub initial: Option<String>,
    /// Serve the status API on this address
    pub status_listen: Option<SocketAddr>,
}

/// Pilot instance wiring all components for one run
pub struct Pilot {
    settings: Settings,
    pool: Arc<CandidatePool>,
    selector: Arc<Selector>,
    supervisor: Arc<Supervisor>,
    tunnel_version: String,
}

impl Pilot {
    /// Create a pilot driving the real tunnel binary
    pub async fn new(settings: Settings) -> Result<Self> {
        let launcher: Arc<dyn TunnelLauncher> = Arc::new(BinaryLauncher::new(
            settings.binary.clone(),
            settings.runtime_dir.clone(),
        ));
        let client: Arc<dyn ProbeClient> = Arc::new(ReqwestProbeClient::new(ExpectedStatus::new(
            settings.probe.expected_status.clone(),
        )));

        settings.validate()?;
        let tunnel_version = Self::check_binary(launcher.as_ref()).await?;
        let pool = CandidatePool::load(&settings.config_dir).await?;

        Ok(Self::assemble(settings, pool, launcher, client, tunnel_version))
    }

    /// Create a pilot from an already loaded pool and custom seams
    pub async fn from_parts(
        settings: Settings,
        pool: CandidatePool,
        launcher: Arc<dyn TunnelLauncher>,
        client: Arc<dyn ProbeClient>,
    ) -> Result<Self> {
        settings.validate()?;
        let tunnel_version = Self::check_binary(launcher.as_ref()).await?;
        Ok(Self::assemble(settings, pool, launcher, client, tunnel_version))
    }

    async fn check_binary(launcher: &dyn TunnelLauncher) -> Result<String> {
        let version = launcher.version().await?;
        info!("Tunnel binary: {}", version);
        Ok(version)
    }

    fn assemble(
        settings: Settings,
        pool: CandidatePool,
        launcher: Arc<dyn TunnelLauncher>,
        client: Arc<dyn ProbeClient>,
        tunnel_version: String,
    ) -> Self {
        let ports = AuxPortPool::new(&settings.auxiliary);
        let prober = Arc::new(Prober::new(launcher.clone(), client, ports, &settings.probe));
        let selector = Arc::new(Selector::new(prober, settings.probe.concurrency));
        let supervisor = Arc::new(Supervisor::new(
            launcher,
            settings.public_ports(),
            &settings.supervisor,
        ));

        Pilot {
            settings,
            pool: Arc::new(pool),
            selector,
            supervisor,
            tunnel_version,
        }
    }

    pub fn pool(&self) -> &Arc<CandidatePool> {
        &self.pool
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run one full evaluation round over the pool
    pub async fn evaluate(&self) -> Evaluation {
        self.selector.select(&self.pool).await
    }

    /// Run until `shutdown` fires
    ///
    /// Errors are fatal: an initial round without a viable candidate, a failed
    /// start, or a swap that lost the public proxy.
    pub async fn run(self, options: RunOptions, shutdown: CancellationToken) -> Result<()> {
        let controller = Controller::new(
            self.pool.clone(),
            self.selector.clone(),
            self.supervisor.clone(),
            &self.settings.controller,
        );

        // stops the status API whichever way this returns
        let status_token = shutdown.child_token();
        let _status_guard = status_token.clone().drop_guard();
        if let Some(addr) = options.status_listen {
            let state = hub::AppState::new(
                self.supervisor.clone(),
                self.pool.clone(),
                controller.evaluations(),
                self.tunnel_version.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = hub::start_server(state, addr, status_token).await {
                    warn!("Status API error: {}", e);
                }
            });
        }

        if let Some(only) = self.pool.single() {
            info!("Single candidate '{}', skipping evaluation", only.id());
            self.supervisor.start(only).await?;
            self.hold(shutdown).await;
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested during startup");
                self.supervisor.stop().await;
                return Ok(());
            }
            started = self.start_initial(&controller, options.initial.as_deref()) => started?,
        }

        controller.run(shutdown).await
    }

    /// Bring up the first tunnel
    ///
    /// Without `initial` a full round runs first and the ranking is walked
    /// until a candidate starts.
    async fn start_initial(&self, controller: &Controller, initial: Option<&str>) -> Result<()> {
        if let Some(id) = initial {
            let candidate = self.pool.get(id).ok_or_else(|| {
                Error::config(format!(
                    "initial candidate '{}' is not in {}",
                    id,
                    self.pool.source().display()
                ))
            })?;
            info!("Starting '{}' without initial evaluation", id);
            return self.supervisor.start(candidate).await;
        }

        let evaluation = self.evaluate().await;
        controller.record_evaluation(&evaluation);
        evaluation.winner()?;

        let mut last_error = Error::NoViableCandidate;
        for ranked in evaluation.ranking.iter() {
            match self.supervisor.start(ranked.candidate.clone()).await {
                Ok(()) => {
                    self.supervisor.record_healthy(ranked.score).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}, trying next candidate", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Keep a single candidate alive until shutdown, restarting it on crash
    async fn hold(&self, shutdown: CancellationToken) {
        let mut watchdog = tokio::time::interval(self.settings.controller.watchdog());
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = watchdog.tick() => {
                    if !self.supervisor.check_alive().await {
                        if let Err(e) = self.supervisor.restart_last().await {
                            error!("Public proxy is DOWN: {}", e);
                        }
                    }
                }
            }
        }
        self.supervisor.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert!(!VERSION.is_empty());
    }
}
