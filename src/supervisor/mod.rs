//! Live tunnel supervisor
//!
//! Owns the single tunnel process bound to the public SOCKS/HTTP ports.
//! Every mutation goes through one async mutex, so start, stop and swap never
//! interleave. Readers get owned [`TunnelSnapshot`]s through a watch channel.

use crate::config::SupervisorConfig;
use crate::pool::Candidate;
use crate::select::millis;
use crate::tunnel::{launch_confirmed, ListenPorts, TunnelHandle, TunnelLauncher};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Health state of the public tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// No process on the public ports
    Stopped,
    /// Process spawned, waiting out the startup grace window
    Starting,
    /// Process up and last check within policy
    Running,
    /// Process up but the last check failed the degradation policy
    Degraded,
    /// Termination in progress
    Stopping,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Running => write!(f, "running"),
            TunnelState::Degraded => write!(f, "degraded"),
            TunnelState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Point-in-time copy of the supervisor state
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub state: TunnelState,
    pub candidate: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub baseline_ms: Option<f64>,
    pub public: ListenPorts,
    pub swaps: u64,
    /// Exit status of the last process that died on its own, kept across restarts
    pub last_exit: Option<String>,
}

struct ActiveTunnel {
    candidate: Arc<Candidate>,
    handle: Box<dyn TunnelHandle>,
    started_at: DateTime<Utc>,
    baseline: Option<Duration>,
}

struct Inner {
    state: TunnelState,
    active: Option<ActiveTunnel>,
    /// Most recently started candidate, kept after crashes for restarts
    last_candidate: Option<Arc<Candidate>>,
    swaps: u64,
    last_exit: Option<String>,
}

/// Owner of the public tunnel
pub struct Supervisor {
    launcher: Arc<dyn TunnelLauncher>,
    public: ListenPorts,
    startup_grace: Duration,
    stop_grace: Duration,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<TunnelSnapshot>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        public: ListenPorts,
        config: &SupervisorConfig,
    ) -> Self {
        let inner = Inner {
            state: TunnelState::Stopped,
            active: None,
            last_candidate: None,
            swaps: 0,
            last_exit: None,
        };
        let (snapshot_tx, _) = watch::channel(Self::snapshot_of(&inner, public));

        Supervisor {
            launcher,
            public,
            startup_grace: config.startup_grace(),
            stop_grace: config.stop_grace(),
            inner: Mutex::new(inner),
            snapshot_tx,
        }
    }

    pub fn public_ports(&self) -> ListenPorts {
        self.public
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> TunnelSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub async fn state(&self) -> TunnelState {
        self.inner.lock().await.state
    }

    /// Candidate bound to the public ports right now
    pub async fn current(&self) -> Option<Arc<Candidate>> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.candidate.clone())
    }

    /// Most recently started candidate, even if it has since died
    pub async fn last_candidate(&self) -> Option<Arc<Candidate>> {
        self.inner.lock().await.last_candidate.clone()
    }

    /// Last-known-good latency of the active tunnel
    pub async fn baseline(&self) -> Option<Duration> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .and_then(|a| a.baseline)
    }

    /// Start `candidate` on the public ports
    ///
    /// Rejected while another tunnel is live; use [`swap`](Self::swap) for that.
    pub async fn start(&self, candidate: Arc<Candidate>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = &inner.active {
            return Err(Error::internal(format!(
                "cannot start '{}': '{}' is already bound to the public ports",
                candidate.id(),
                active.candidate.id()
            )));
        }
        self.start_locked(&mut inner, candidate).await
    }

    /// Stop the public tunnel; a no-op when nothing runs
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
    }

    /// Replace the public tunnel with `next`
    ///
    /// The current process is stopped before `next` starts, so the public
    /// ports are briefly unavailable but never served by two processes. If
    /// `next` fails to start the previous candidate is restarted and
    /// [`Error::SwapRolledBack`] is returned; if that fails as well the
    /// result is the fatal [`Error::SwapFailure`].
    pub async fn swap(&self, next: Arc<Candidate>) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let previous = inner
            .active
            .as_ref()
            .map(|a| a.candidate.clone())
            .or_else(|| inner.last_candidate.clone());

        if let (Some(active), Some(prev)) = (&inner.active, &previous) {
            if prev.id() == next.id() {
                debug!("Swap to '{}' skipped, already active", active.candidate.id());
                return Ok(());
            }
        }

        let from = previous
            .as_ref()
            .map(|c| c.id().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        info!("Swapping tunnel '{}' -> '{}'", from, next.id());

        let gap = Instant::now();
        self.stop_locked(&mut inner).await;

        let err = match self.start_locked(&mut inner, next.clone()).await {
            Ok(()) => {
                inner.swaps += 1;
                self.publish(&inner);
                info!(
                    "Swap '{}' -> '{}' complete, public ports were down for {}ms",
                    from,
                    next.id(),
                    gap.elapsed().as_millis()
                );
                return Ok(());
            }
            Err(e) => e,
        };

        let Some(previous) = previous else {
            return Err(err);
        };

        warn!(
            "Swap to '{}' failed ({}), restoring '{}'",
            next.id(),
            err,
            previous.id()
        );
        match self.start_locked(&mut inner, previous).await {
            Ok(()) => Err(Error::SwapRolledBack {
                from,
                to: next.id().to_string(),
                reason: err.to_string(),
            }),
            Err(fallback) => {
                error!(
                    "Public proxy is DOWN: '{}' failed ({}) and '{}' could not be restored ({})",
                    next.id(),
                    err,
                    from,
                    fallback
                );
                Err(Error::SwapFailure {
                    from,
                    to: next.id().to_string(),
                    reason: format!("{}; fallback: {}", err, fallback),
                })
            }
        }
    }

    /// Restart the most recent candidate if nothing is running
    pub async fn restart_last(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            return Ok(());
        }
        let candidate = inner
            .last_candidate
            .clone()
            .ok_or_else(|| Error::internal("no previous candidate to restart"))?;
        info!("Restarting tunnel '{}'", candidate.id());
        self.start_locked(&mut inner, candidate).await
    }

    /// Whether the public tunnel is still alive
    ///
    /// A process that exited on its own is dropped and the state becomes
    /// `Stopped`; the candidate stays available to [`restart_last`](Self::restart_last).
    pub async fn check_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.as_mut() else {
            return false;
        };
        let Some(status) = active.handle.exit_status() else {
            return true;
        };

        error!(
            "Tunnel '{}' exited unexpectedly: {}",
            active.candidate.id(),
            status
        );
        inner.active = None;
        inner.state = TunnelState::Stopped;
        inner.last_exit = Some(status);
        self.publish(&inner);
        false
    }

    /// Flag the live tunnel as failing its health policy
    pub async fn mark_degraded(&self) {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() && inner.state == TunnelState::Running {
            inner.state = TunnelState::Degraded;
            self.publish(&inner);
        }
    }

    /// Record a healthy measurement as the new baseline
    pub async fn record_healthy(&self, latency: Duration) {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.as_mut() else {
            return;
        };
        active.baseline = Some(latency);
        inner.state = TunnelState::Running;
        self.publish(&inner);
    }

    async fn start_locked(&self, inner: &mut Inner, candidate: Arc<Candidate>) -> Result<()> {
        self.set_state(inner, TunnelState::Starting);

        let launched = match self.public.ensure_bindable() {
            Ok(()) => {
                launch_confirmed(
                    self.launcher.as_ref(),
                    &candidate,
                    self.public,
                    self.startup_grace,
                )
                .await
            }
            Err(reason) => Err(Error::startup(candidate.id(), reason)),
        };

        match launched {
            Ok(handle) => {
                info!(
                    "Tunnel '{}' running on {} (pid {:?})",
                    candidate.id(),
                    self.public,
                    handle.pid()
                );
                inner.active = Some(ActiveTunnel {
                    candidate: candidate.clone(),
                    handle,
                    started_at: Utc::now(),
                    baseline: None,
                });
                inner.last_candidate = Some(candidate);
                self.set_state(inner, TunnelState::Running);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start tunnel '{}': {}", candidate.id(), e);
                self.set_state(inner, TunnelState::Stopped);
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        let Some(mut active) = inner.active.take() else {
            if inner.state != TunnelState::Stopped {
                self.set_state(inner, TunnelState::Stopped);
            }
            return;
        };

        self.set_state(inner, TunnelState::Stopping);
        info!("Stopping tunnel '{}'...", active.candidate.id());
        active.handle.terminate(self.stop_grace).await;
        self.set_state(inner, TunnelState::Stopped);
        info!("Tunnel '{}' stopped", active.candidate.id());
    }

    fn set_state(&self, inner: &mut Inner, state: TunnelState) {
        if inner.state != state {
            debug!("Tunnel state: {} -> {}", inner.state, state);
            inner.state = state;
        }
        self.publish(inner);
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx
            .send_replace(Self::snapshot_of(inner, self.public));
    }

    fn snapshot_of(inner: &Inner, public: ListenPorts) -> TunnelSnapshot {
        let active = inner.active.as_ref();
        TunnelSnapshot {
            state: inner.state,
            candidate: active.map(|a| a.candidate.id().to_string()),
            pid: active.and_then(|a| a.handle.pid()),
            started_at: active.map(|a| a.started_at),
            baseline_ms: active.and_then(|a| a.baseline).map(millis),
            public,
            swaps: inner.swaps,
            last_exit: inner.last_exit.clone(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // the child handle is kill_on_drop, this only makes the event visible
        if let Ok(inner) = self.inner.try_lock() {
            if let Some(active) = &inner.active {
                warn!(
                    "Supervisor dropped with '{}' still running, killing it",
                    active.candidate.id()
                );
            }
        }
    }
}
