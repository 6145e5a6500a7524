//! Probe outcomes and scoring

use serde::Serialize;
use std::time::Duration;

/// Why a single target request failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ProbeErrorKind {
    /// Request did not finish within its budget
    Timeout,
    /// Proxy or target refused or reset the connection
    Connection,
    /// Response arrived with a status outside the expected set
    UnexpectedStatus(u16),
    /// Tunnel never came up, so the target was not attempted
    StartupFailure,
    /// No auxiliary port pair was free, so the candidate was never launched
    NoPortAvailable,
    Other(String),
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeErrorKind::Timeout => write!(f, "timeout"),
            ProbeErrorKind::Connection => write!(f, "connection error"),
            ProbeErrorKind::UnexpectedStatus(code) => write!(f, "HTTP {}", code),
            ProbeErrorKind::StartupFailure => write!(f, "startup failure"),
            ProbeErrorKind::NoPortAvailable => write!(f, "no free auxiliary port"),
            ProbeErrorKind::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Result of one request to one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    /// Round-trip time, present only on success
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Option<Duration>,
    pub error: Option<ProbeErrorKind>,
}

impl TargetOutcome {
    pub fn succeeded(target: impl Into<String>, latency: Duration) -> Self {
        TargetOutcome {
            target: target.into(),
            latency: Some(latency),
            error: None,
        }
    }

    pub fn failed(target: impl Into<String>, error: ProbeErrorKind) -> Self {
        TargetOutcome {
            target: target.into(),
            latency: None,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.latency.is_some()
    }
}

fn serialize_millis<S: serde::Serializer>(
    latency: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match latency {
        Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}

/// Outcome of probing one candidate against every target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub candidate: String,
    pub outcomes: Vec<TargetOutcome>,
    /// Startup error text when the tunnel never came up
    pub note: Option<String>,
}

impl ProbeResult {
    pub fn new(candidate: impl Into<String>, outcomes: Vec<TargetOutcome>) -> Self {
        ProbeResult {
            candidate: candidate.into(),
            outcomes,
            note: None,
        }
    }

    /// A result with every target marked as `StartupFailure`
    pub fn startup_failure<S: AsRef<str>>(
        candidate: impl Into<String>,
        targets: &[S],
        reason: impl Into<String>,
    ) -> Self {
        ProbeResult {
            candidate: candidate.into(),
            outcomes: targets
                .iter()
                .map(|t| TargetOutcome::failed(t.as_ref(), ProbeErrorKind::StartupFailure))
                .collect(),
            note: Some(reason.into()),
        }
    }

    /// A result for a candidate that never got an auxiliary pair
    ///
    /// Says nothing about the candidate itself; see [`was_measured`](Self::was_measured).
    pub fn unmeasured<S: AsRef<str>>(
        candidate: impl Into<String>,
        targets: &[S],
        reason: impl Into<String>,
    ) -> Self {
        ProbeResult {
            candidate: candidate.into(),
            outcomes: targets
                .iter()
                .map(|t| TargetOutcome::failed(t.as_ref(), ProbeErrorKind::NoPortAvailable))
                .collect(),
            note: Some(reason.into()),
        }
    }

    /// Median latency of the successful requests, `None` when nothing succeeded
    pub fn score(&self) -> Option<Duration> {
        median(self.outcomes.iter().filter_map(|o| o.latency).collect())
    }

    pub fn is_viable(&self) -> bool {
        self.score().is_some()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success()).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }

    /// Whether the candidate was actually launched and measured
    pub fn was_measured(&self) -> bool {
        self.outcomes.is_empty()
            || self
                .outcomes
                .iter()
                .any(|o| o.error != Some(ProbeErrorKind::NoPortAvailable))
    }

    pub fn startup_failed(&self) -> bool {
        if !self.was_measured() {
            return false;
        }
        self.note.is_some()
            || (!self.outcomes.is_empty()
                && self
                    .outcomes
                    .iter()
                    .all(|o| o.error == Some(ProbeErrorKind::StartupFailure)))
    }

    /// Short human-readable reason for a non-viable result
    pub fn failure_summary(&self) -> String {
        if let Some(note) = &self.note {
            return note.clone();
        }
        let errors: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.target, e)))
            .collect();
        if errors.is_empty() {
            "no targets probed".to_string()
        } else {
            errors.join(", ")
        }
    }
}

/// Median of `values`; the mean of the two middle values for even counts
pub fn median(mut values: Vec<Duration>) -> Option<Duration> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![ms(50)]), Some(ms(50)));
        assert_eq!(median(vec![ms(90), ms(10), ms(50)]), Some(ms(50)));
        assert_eq!(median(vec![ms(40), ms(10), ms(20), ms(30)]), Some(ms(25)));
    }

    #[test]
    fn test_score_ignores_failures() {
        let result = ProbeResult::new(
            "a",
            vec![
                TargetOutcome::succeeded("t1", ms(30)),
                TargetOutcome::failed("t2", ProbeErrorKind::Timeout),
                TargetOutcome::succeeded("t3", ms(50)),
            ],
        );
        assert_eq!(result.score(), Some(ms(40)));
        assert_eq!(result.successes(), 2);
        assert_eq!(result.failures(), 1);
        assert!(!result.startup_failed());
    }

    #[test]
    fn test_zero_successes_is_not_viable() {
        let result = ProbeResult::new(
            "a",
            vec![
                TargetOutcome::failed("t1", ProbeErrorKind::Connection),
                TargetOutcome::failed("t2", ProbeErrorKind::UnexpectedStatus(502)),
            ],
        );
        assert!(!result.is_viable());
        assert_eq!(result.failure_summary(), "t1: connection error, t2: HTTP 502");
    }

    #[test]
    fn test_startup_failure() {
        let result = ProbeResult::startup_failure("c", &["t1", "t2"], "exited within 3000ms");
        assert!(result.startup_failed());
        assert!(!result.is_viable());
        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(result.failure_summary(), "exited within 3000ms");
    }

    #[test]
    fn test_unmeasured_is_not_a_startup_failure() {
        let result = ProbeResult::unmeasured("c", &["t1", "t2"], "no free auxiliary port pair");
        assert!(!result.was_measured());
        assert!(!result.startup_failed());
        assert!(!result.is_viable());
        assert_eq!(result.failure_summary(), "no free auxiliary port pair");

        let failed = ProbeResult::startup_failure("c", &["t1"], "exited");
        assert!(failed.was_measured());
    }

    #[test]
    fn test_outcome_serializes_millis() {
        let json = serde_json::to_value(TargetOutcome::succeeded("t", ms(42))).unwrap();
        assert_eq!(json["latency_ms"], 42.0);
        assert!(json["error"].is_null());
    }
}
