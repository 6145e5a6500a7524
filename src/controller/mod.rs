//! Periodic controller
//!
//! The top-level loop. Every tick runs a cheap check of the live tunnel; a
//! degraded tick starts a full evaluation round unless one is already running.
//! Rounds run on their own task and hand their result back to the loop, which
//! applies it. All Supervisor calls therefore happen on the loop task.

use crate::config::ControllerConfig;
use crate::pool::CandidatePool;
use crate::probe::ProbeResult;
use crate::select::{millis, Evaluation, EvaluationSummary, Selector};
use crate::supervisor::Supervisor;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Below this increase the ratio rule never fires
pub const RATIO_FLOOR: Duration = Duration::from_millis(50);

/// Last evaluation summary, shared with status readers
pub type EvaluationSlot = Arc<RwLock<Option<EvaluationSummary>>>;

/// Outcome of a cheap check
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Within policy, with the measured latency
    Healthy(Duration),
    /// Outside policy, with a reason
    Degraded(String),
}

impl Verdict {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Verdict::Degraded(_))
    }
}

/// Decides whether a measurement of the live tunnel counts as degraded
#[derive(Debug, Clone)]
pub struct DegradationPolicy {
    max_increase: Duration,
    max_ratio: f64,
}

impl DegradationPolicy {
    pub fn new(max_increase: Duration, max_ratio: f64) -> Self {
        DegradationPolicy {
            max_increase,
            max_ratio,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.max_increase(), config.max_ratio)
    }

    /// Judge `result` against the last-known-good `baseline`
    ///
    /// Without a baseline only target failures count.
    pub fn assess(&self, baseline: Option<Duration>, result: &ProbeResult) -> Verdict {
        if result.failures() > 0 {
            return Verdict::Degraded(result.failure_summary());
        }
        let Some(latency) = result.score() else {
            return Verdict::Degraded("no targets probed".to_string());
        };
        let Some(baseline) = baseline else {
            return Verdict::Healthy(latency);
        };

        let increase = latency.saturating_sub(baseline);
        if increase > self.max_increase {
            return Verdict::Degraded(format!(
                "latency {:.1}ms is more than {}ms above baseline {:.1}ms",
                millis(latency),
                self.max_increase.as_millis(),
                millis(baseline)
            ));
        }
        let ratio_exceeded = latency.as_secs_f64() > baseline.as_secs_f64() * self.max_ratio;
        if ratio_exceeded && increase > RATIO_FLOOR {
            return Verdict::Degraded(format!(
                "latency {:.1}ms is more than {}x baseline {:.1}ms",
                millis(latency),
                self.max_ratio,
                millis(baseline)
            ));
        }
        Verdict::Healthy(latency)
    }
}

/// Whether a winner scoring `winner` beats a current candidate scoring `current`
///
/// A current candidate that was not viable this round is always beaten.
pub fn outperforms(winner: Duration, current: Option<Duration>, min_improvement: f64) -> bool {
    match current {
        None => true,
        Some(current) => winner.as_secs_f64() < current.as_secs_f64() * (1.0 - min_improvement),
    }
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    RoundStarted,
    /// Degraded, but a round was already in flight
    RoundSkipped,
}

type RoundDone = (Evaluation, OwnedMutexGuard<()>);

struct Rounds {
    tx: mpsc::Sender<RoundDone>,
    rx: mpsc::Receiver<RoundDone>,
    task: Option<JoinHandle<()>>,
}

/// The periodic re-evaluation loop
pub struct Controller {
    pool: Arc<CandidatePool>,
    selector: Arc<Selector>,
    supervisor: Arc<Supervisor>,
    policy: DegradationPolicy,
    min_improvement: f64,
    interval: Duration,
    watchdog: Duration,
    round_lock: Arc<Mutex<()>>,
    last_evaluation: EvaluationSlot,
}

impl Controller {
    pub fn new(
        pool: Arc<CandidatePool>,
        selector: Arc<Selector>,
        supervisor: Arc<Supervisor>,
        config: &ControllerConfig,
    ) -> Self {
        Controller {
            pool,
            selector,
            supervisor,
            policy: DegradationPolicy::from_config(config),
            min_improvement: config.min_improvement,
            interval: config.interval(),
            watchdog: config.watchdog(),
            round_lock: Arc::new(Mutex::new(())),
            last_evaluation: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the last evaluation summary
    pub fn evaluations(&self) -> EvaluationSlot {
        self.last_evaluation.clone()
    }

    pub fn record_evaluation(&self, evaluation: &Evaluation) {
        *self.last_evaluation.write() = Some(evaluation.summary());
    }

    /// Run until `shutdown` fires or a fatal error occurs
    ///
    /// On exit any in-flight round or swap is abandoned and the live tunnel is
    /// stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut rounds = Rounds { tx, rx, task: None };

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = interval_at(Instant::now() + self.watchdog, self.watchdog);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Periodic controller started: checking every {}s, {} candidates",
            self.interval.as_secs(),
            self.pool.len()
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some((evaluation, guard)) = rounds.rx.recv() => {
                    rounds.task = None;
                    // a cancelled swap drops its half-started process, the final stop settles state
                    let applied = tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        applied = self.apply_round(&evaluation) => applied,
                    };
                    drop(guard);
                    if let Err(e) = applied {
                        if e.is_fatal() {
                            break Err(e);
                        }
                        warn!("Evaluation round not applied: {}", e);
                    }
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        outcome = self.tick(&mut rounds) => debug!("Tick: {:?}", outcome),
                    }
                }
                _ = watchdog.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = self.watch(&mut rounds) => {}
                    }
                }
            }
        };

        if let Some(task) = rounds.task.take() {
            info!("Aborting in-flight evaluation");
            task.abort();
            let _ = task.await;
        }
        self.supervisor.stop().await;
        info!("Periodic controller stopped");
        result
    }

    /// Measure the live tunnel through the public SOCKS port
    ///
    /// A dead or missing tunnel is degraded without measuring. A healthy result
    /// becomes the new baseline.
    pub async fn check(&self) -> Verdict {
        if !self.supervisor.check_alive().await {
            self.supervisor.mark_degraded().await;
            return Verdict::Degraded("tunnel is not running".to_string());
        }
        let label = self
            .supervisor
            .current()
            .await
            .map(|c| c.id().to_string())
            .unwrap_or_else(|| "public".to_string());

        let proxy = self.supervisor.public_ports().socks_connect_addr();
        let result = self.selector.prober().measure(&label, proxy).await;
        let verdict = self.policy.assess(self.supervisor.baseline().await, &result);

        match &verdict {
            Verdict::Healthy(latency) => {
                debug!("'{}' healthy at {:.1}ms", label, millis(*latency));
                self.supervisor.record_healthy(*latency).await;
            }
            Verdict::Degraded(reason) => {
                warn!("'{}' degraded: {}", label, reason);
                self.supervisor.mark_degraded().await;
            }
        }
        verdict
    }

    /// Apply a finished round to the Supervisor
    ///
    /// Only [`Error::SwapFailure`] is returned; every other problem is logged.
    /// A current candidate that got no auxiliary pair this round is kept.
    pub async fn apply_round(&self, evaluation: &Evaluation) -> Result<()> {
        self.record_evaluation(evaluation);

        let Some(current) = self.supervisor.current().await else {
            self.recover(evaluation).await;
            return Ok(());
        };

        let winner = match evaluation.winner() {
            Ok(winner) => winner,
            Err(_) => {
                warn!("No viable candidate this round, keeping '{}'", current.id());
                return Ok(());
            }
        };

        let current_score = evaluation.score_of(current.id());
        if current_score.is_none() && !evaluation.was_measured(current.id()) {
            warn!(
                "'{}' could not be measured this round, keeping it over '{}'",
                current.id(),
                winner.id()
            );
            return Ok(());
        }
        if winner.id() != current.id()
            && outperforms(winner.score, current_score, self.min_improvement)
        {
            info!(
                "Switching '{}' ({}) -> '{}' ({:.1}ms)",
                current.id(),
                current_score
                    .map(|s| format!("{:.1}ms", millis(s)))
                    .unwrap_or_else(|| "not viable".to_string()),
                winner.id(),
                millis(winner.score)
            );
            match self.supervisor.swap(winner.candidate.clone()).await {
                Ok(()) => {}
                Err(e @ Error::SwapFailure { .. }) => return Err(e),
                Err(e) => warn!("{}", e),
            }
        } else {
            info!(
                "Keeping '{}', winner '{}' ({:.1}ms) is not better by {:.0}%",
                current.id(),
                winner.id(),
                millis(winner.score),
                self.min_improvement * 100.0
            );
        }

        if let Some(active) = self.supervisor.current().await {
            if let Some(score) = evaluation.score_of(active.id()) {
                self.supervisor.record_healthy(score).await;
            }
        }
        Ok(())
    }

    /// Nothing is running: start the best candidate that will start
    async fn recover(&self, evaluation: &Evaluation) {
        for ranked in evaluation.ranking.iter() {
            match self.supervisor.start(ranked.candidate.clone()).await {
                Ok(()) => {
                    info!("Recovered with '{}' ({:.1}ms)", ranked.id(), millis(ranked.score));
                    self.supervisor.record_healthy(ranked.score).await;
                    return;
                }
                Err(e) => warn!("{}, trying next candidate", e),
            }
        }

        if evaluation.ranking.is_empty() {
            warn!("No viable candidate, restarting the previous one");
        }
        if let Err(e) = self.supervisor.restart_last().await {
            error!("Public proxy is DOWN, no candidate could be started: {}", e);
        }
    }

    async fn tick(&self, rounds: &mut Rounds) -> TickOutcome {
        match self.check().await {
            Verdict::Healthy(_) => TickOutcome::Healthy,
            Verdict::Degraded(reason) => self.start_round(&reason, rounds),
        }
    }

    /// Crash detection between ticks
    async fn watch(&self, rounds: &mut Rounds) {
        if self.supervisor.check_alive().await {
            return;
        }
        match self.supervisor.restart_last().await {
            Ok(()) => info!("Watchdog restarted the tunnel"),
            Err(e) => {
                warn!("Watchdog restart failed: {}", e);
                self.start_round("tunnel down", rounds);
            }
        }
    }

    fn start_round(&self, reason: &str, rounds: &mut Rounds) -> TickOutcome {
        let guard = match self.round_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Evaluation already in progress, skipping ({})", reason);
                return TickOutcome::RoundSkipped;
            }
        };

        info!("Starting full evaluation ({})", reason);
        let selector = self.selector.clone();
        let pool = self.pool.clone();
        let tx = rounds.tx.clone();
        rounds.task = Some(tokio::spawn(async move {
            let evaluation = selector.select(&pool).await;
            // a closed channel means the loop is gone; the guard drops either way
            let _ = tx.send((evaluation, guard)).await;
        }));
        TickOutcome::RoundStarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeErrorKind, TargetOutcome};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn measured(latencies: &[u64]) -> ProbeResult {
        ProbeResult::new(
            "live",
            latencies
                .iter()
                .map(|l| TargetOutcome::succeeded("t", ms(*l)))
                .collect(),
        )
    }

    fn policy() -> DegradationPolicy {
        DegradationPolicy::from_config(&ControllerConfig::default())
    }

    #[test]
    fn test_healthy_within_limits() {
        let verdict = policy().assess(Some(ms(40)), &measured(&[60, 70, 80]));
        assert_eq!(verdict, Verdict::Healthy(ms(70)));
    }

    #[test]
    fn test_first_check_without_baseline() {
        assert_eq!(policy().assess(None, &measured(&[900])), Verdict::Healthy(ms(900)));
    }

    #[test]
    fn test_any_failure_degrades() {
        let result = ProbeResult::new(
            "live",
            vec![
                TargetOutcome::succeeded("a", ms(20)),
                TargetOutcome::failed("b", ProbeErrorKind::Timeout),
            ],
        );
        assert!(policy().assess(Some(ms(20)), &result).is_degraded());
        assert!(policy().assess(None, &ProbeResult::new("live", vec![])).is_degraded());
    }

    #[test]
    fn test_absolute_increase_degrades() {
        assert!(policy().assess(Some(ms(100)), &measured(&[301])).is_degraded());
        assert!(!policy().assess(Some(ms(100)), &measured(&[300])).is_degraded());
    }

    #[test]
    fn test_ratio_needs_floor() {
        // 5x but only 40ms worse
        assert!(!policy().assess(Some(ms(10)), &measured(&[50])).is_degraded());
        // 5x and 80ms worse
        assert!(policy().assess(Some(ms(20)), &measured(&[100])).is_degraded());
    }

    #[test]
    fn test_outperforms() {
        assert!(outperforms(ms(500), None, 0.2));
        assert!(outperforms(ms(40), Some(ms(400)), 0.2));
        assert!(!outperforms(ms(85), Some(ms(100)), 0.2));
        assert!(outperforms(ms(79), Some(ms(100)), 0.2));
        assert!(outperforms(ms(99), Some(ms(100)), 0.0));
    }
}
