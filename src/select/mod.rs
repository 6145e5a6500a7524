//! Candidate selection
//!
//! Probes the whole pool with bounded concurrency and ranks the results by
//! aggregate latency. Ties are broken by candidate id so that identical
//! probe results always produce the same ranking.

use crate::pool::{Candidate, CandidatePool};
use crate::probe::{ProbeResult, Prober};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A viable candidate and its aggregate score
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: Arc<Candidate>,
    pub score: Duration,
}

impl RankedCandidate {
    pub fn id(&self) -> &str {
        self.candidate.id()
    }
}

/// Viable candidates, best first
#[derive(Debug, Clone, Default)]
pub struct Ranking(Vec<RankedCandidate>);

impl Ranking {
    pub fn winner(&self) -> Option<&RankedCandidate> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedCandidate> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.0.iter().map(RankedCandidate::id).collect()
    }

    pub fn get(&self, id: &str) -> Option<&RankedCandidate> {
        self.0.iter().find(|r| r.id() == id)
    }
}

/// A candidate excluded from the ranking
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NonViable {
    pub candidate: String,
    pub reason: String,
    pub startup_failure: bool,
    /// Never launched for lack of an auxiliary pair
    pub unmeasured: bool,
}

/// Rank probe results
///
/// Results for ids missing from `pool` are ignored.
pub fn rank(pool: &CandidatePool, results: &[ProbeResult]) -> (Ranking, Vec<NonViable>) {
    let mut ranked = Vec::new();
    let mut non_viable = Vec::new();

    for result in results {
        let Some(candidate) = pool.get(&result.candidate) else {
            continue;
        };
        match result.score() {
            Some(score) => ranked.push(RankedCandidate { candidate, score }),
            None => non_viable.push(NonViable {
                candidate: result.candidate.clone(),
                reason: result.failure_summary(),
                startup_failure: result.startup_failed(),
                unmeasured: !result.was_measured(),
            }),
        }
    }

    ranked.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.id().cmp(b.id())));
    non_viable.sort_by(|a, b| a.candidate.cmp(&b.candidate));

    (Ranking(ranked), non_viable)
}

/// Output of one evaluation round
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub ranking: Ranking,
    pub non_viable: Vec<NonViable>,
    pub results: Vec<ProbeResult>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl Evaluation {
    pub fn from_results(
        pool: &CandidatePool,
        mut results: Vec<ProbeResult>,
        elapsed: Duration,
    ) -> Self {
        // buffer_unordered yields in completion order
        results.sort_by(|a, b| a.candidate.cmp(&b.candidate));
        let (ranking, non_viable) = rank(pool, &results);
        Evaluation {
            ranking,
            non_viable,
            results,
            finished_at: Utc::now(),
            elapsed,
        }
    }

    /// Best candidate, or [`Error::NoViableCandidate`]
    pub fn winner(&self) -> Result<&RankedCandidate> {
        self.ranking.winner().ok_or(Error::NoViableCandidate)
    }

    /// Score `id` achieved in this round, `None` if it was not viable
    pub fn score_of(&self, id: &str) -> Option<Duration> {
        self.ranking.get(id).map(|r| r.score)
    }

    /// Whether `id` was launched and measured this round
    pub fn was_measured(&self, id: &str) -> bool {
        self.results
            .iter()
            .find(|r| r.candidate == id)
            .is_some_and(|r| r.was_measured())
    }

    pub fn summary(&self) -> EvaluationSummary {
        EvaluationSummary {
            finished_at: self.finished_at,
            elapsed_ms: self.elapsed.as_millis() as u64,
            ranking: self
                .ranking
                .iter()
                .map(|r| RankedEntry {
                    candidate: r.id().to_string(),
                    score_ms: millis(r.score),
                })
                .collect(),
            non_viable: self.non_viable.clone(),
        }
    }

    /// Report the round: winner, every score, every excluded candidate
    pub fn log(&self) {
        match self.ranking.winner() {
            Some(best) => info!(
                "Evaluation finished in {}ms: winner '{}' ({:.1}ms), {} viable, {} non-viable",
                self.elapsed.as_millis(),
                best.id(),
                millis(best.score),
                self.ranking.len(),
                self.non_viable.len()
            ),
            None => warn!(
                "Evaluation finished in {}ms: no viable candidate among {}",
                self.elapsed.as_millis(),
                self.results.len()
            ),
        }
        for (i, ranked) in self.ranking.iter().enumerate() {
            info!("  {}. {}: {:.1}ms", i + 1, ranked.id(), millis(ranked.score));
        }
        for excluded in &self.non_viable {
            warn!("  non-viable {}: {}", excluded.candidate, excluded.reason);
        }
    }
}

/// Serializable view of an [`Evaluation`]
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub ranking: Vec<RankedEntry>,
    pub non_viable: Vec<NonViable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    pub candidate: String,
    pub score_ms: f64,
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Runs probers over a pool
pub struct Selector {
    prober: Arc<Prober>,
    concurrency: usize,
}

impl Selector {
    /// The effective concurrency never exceeds the auxiliary pair capacity
    pub fn new(prober: Arc<Prober>, concurrency: usize) -> Self {
        let concurrency = concurrency.min(prober.ports().capacity()).max(1);
        Selector {
            prober,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    /// Upper bound on the wall-clock time of [`select`](Self::select)
    pub fn round_budget(&self, pool_size: usize) -> Duration {
        let waves = pool_size.div_ceil(self.concurrency) as u32;
        self.prober.probe_budget() * waves
    }

    /// Probe every candidate and rank the results
    pub async fn select(&self, pool: &CandidatePool) -> Evaluation {
        let started = Instant::now();
        info!(
            "Evaluating {} candidate(s), {} at a time",
            pool.len(),
            self.concurrency
        );

        let results: Vec<ProbeResult> = stream::iter(pool.iter().cloned())
            .map(|candidate| {
                let prober = self.prober.clone();
                async move { prober.probe(&candidate).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let evaluation = Evaluation::from_results(pool, results, started.elapsed());
        evaluation.log();
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeErrorKind, TargetOutcome};
    use serde_yaml::Mapping;

    fn pool(ids: &[&str]) -> CandidatePool {
        CandidatePool::from_candidates(
            ids.iter()
                .map(|id| Candidate::new(*id, format!("/etc/hysteria/{}.yaml", id), Mapping::new()))
                .collect(),
        )
        .unwrap()
    }

    fn ok(id: &str, latencies: &[u64]) -> ProbeResult {
        ProbeResult::new(
            id,
            latencies
                .iter()
                .enumerate()
                .map(|(i, ms)| {
                    TargetOutcome::succeeded(format!("t{}", i), Duration::from_millis(*ms))
                })
                .collect(),
        )
    }

    fn failed(id: &str) -> ProbeResult {
        ProbeResult::new(id, vec![TargetOutcome::failed("t0", ProbeErrorKind::Timeout)])
    }

    #[test]
    fn test_rank_orders_by_score_and_excludes_non_viable() {
        let pool = pool(&["a", "b", "c"]);
        let results = vec![
            ok("a", &[50, 50, 50]),
            ok("b", &[30, 31, 29]),
            ProbeResult::startup_failure("c", &["t0"], "exited"),
        ];

        let (ranking, non_viable) = rank(&pool, &results);

        assert_eq!(ranking.ids(), vec!["b", "a"]);
        assert_eq!(ranking.winner().unwrap().score, Duration::from_millis(30));
        assert_eq!(non_viable.len(), 1);
        assert_eq!(non_viable[0].candidate, "c");
        assert!(non_viable[0].startup_failure);
    }

    #[test]
    fn test_ties_break_by_id_regardless_of_input_order() {
        let pool = pool(&["alpha", "beta", "gamma"]);
        let forward = vec![ok("gamma", &[40]), ok("alpha", &[40]), ok("beta", &[40])];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(rank(&pool, &forward).0.ids(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(rank(&pool, &backward).0.ids(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_all_failed_means_no_viable_candidate() {
        let pool = pool(&["a", "b"]);
        let evaluation =
            Evaluation::from_results(&pool, vec![failed("b"), failed("a")], Duration::ZERO);

        assert!(evaluation.ranking.is_empty());
        assert!(matches!(evaluation.winner(), Err(Error::NoViableCandidate)));
        assert_eq!(evaluation.non_viable.len(), 2);
        assert_eq!(evaluation.results[0].candidate, "a");
    }

    #[test]
    fn test_summary() {
        let pool = pool(&["a", "b"]);
        let results = vec![ok("a", &[20]), failed("b")];
        let evaluation = Evaluation::from_results(&pool, results, Duration::from_millis(7));
        let summary = evaluation.summary();

        assert_eq!(summary.elapsed_ms, 7);
        assert_eq!(summary.ranking.len(), 1);
        assert_eq!(summary.ranking[0].candidate, "a");
        assert_eq!(summary.ranking[0].score_ms, 20.0);
        assert_eq!(summary.non_viable[0].candidate, "b");
        assert_eq!(evaluation.score_of("a"), Some(Duration::from_millis(20)));
        assert_eq!(evaluation.score_of("b"), None);
    }

    #[test]
    fn test_unmeasured_candidate_is_flagged() {
        let pool = pool(&["a", "b"]);
        let results = vec![
            ok("a", &[20]),
            ProbeResult::unmeasured("b", &["t0"], "no free auxiliary port pair"),
        ];
        let evaluation = Evaluation::from_results(&pool, results, Duration::ZERO);

        assert_eq!(evaluation.non_viable.len(), 1);
        assert!(evaluation.non_viable[0].unmeasured);
        assert!(!evaluation.non_viable[0].startup_failure);
        assert!(evaluation.was_measured("a"));
        assert!(!evaluation.was_measured("b"));
        assert!(!evaluation.was_measured("missing"));
    }
}
