//! Dispatcher — picks the worker peer that services each job.
//!
//! One logical scheduler per gateway. Scheduling is pure in-memory state
//! manipulation under a mutex: no await points, no I/O. For each job the
//! dispatcher filters out peers whose circuit is open or whose in-flight
//! count is saturated, scores the rest on latency, load, failure rate, and
//! replication lag, and assigns the lowest score. Consecutive failures open
//! a per-peer circuit breaker; a healthy metrics report closes it again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Tunables for peer selection and the circuit breaker.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs_per_peer: u32,
    /// A circuit-open peer whose reported failure rate drops below this is
    /// restored.
    pub max_failure_rate: f64,
    /// Replication lag above this many blocks is added to the score.
    pub reassign_on_lag_blocks: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_duration: Duration,
    pub weight_latency: f64,
    pub weight_in_flight: f64,
    pub weight_failure: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_per_peer: 3,
            max_failure_rate: 0.4,
            reassign_on_lag_blocks: 500,
            circuit_breaker_threshold: 5,
            circuit_breaker_duration: Duration::from_secs(60),
            weight_latency: 1.0,
            weight_in_flight: 25.0,
            weight_failure: 500.0,
        }
    }
}

/// Metrics a worker peer reports on its heartbeat.
///
/// Unknown fields land in `extra` and are logged but never scored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetricsReport {
    pub latency_ms: Option<f64>,
    pub hyperbee_lag: Option<u64>,
    pub failure_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A request to assign one subscription/publish job to a peer.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub relay_id: String,
    /// Candidate peers currently claiming to host the relay.
    pub peers: Vec<String>,
}

/// Why a job could not be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The job arrived with no candidate peers at all.
    NoPeers,
    /// Candidates were present but none was usable (malformed ids).
    NoCandidate,
    /// Every usable candidate is saturated or circuit-open.
    PeersSaturated,
}

impl RejectReason {
    /// Wire slug used in NOTICE frames and REST errors.
    #[must_use]
    pub fn as_slug(self) -> &'static str {
        match self {
            Self::NoPeers => "no-peers",
            Self::NoCandidate => "no-candidate",
            Self::PeersSaturated => "peers-saturated",
        }
    }
}

/// Result of [`Dispatcher::schedule`].
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Assigned { job_id: String, peer_id: String },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Default)]
struct PeerState {
    latency_ms: f64,
    in_flight: u32,
    failure_rate: f64,
    consecutive_failures: u32,
    hyperbee_lag: u64,
    circuit_broken_until: Option<Instant>,
    last_assigned_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, PeerState>,
    /// job id → assigned peer id.
    jobs: HashMap<String, String>,
}

/// The per-gateway job scheduler.
pub struct Dispatcher {
    config: DispatcherConfig,
    inner: Mutex<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher with the given tunables.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Pick a peer for the job, or explain why none was available.
    ///
    /// Never blocks: pure in-memory selection under the scheduler lock.
    pub fn schedule(&self, job: &JobRequest) -> ScheduleOutcome {
        if job.peers.is_empty() {
            return ScheduleOutcome::Rejected {
                reason: RejectReason::NoPeers,
            };
        }

        let usable: Vec<&String> = job.peers.iter().filter(|p| !p.is_empty()).collect();
        if usable.is_empty() {
            return ScheduleOutcome::Rejected {
                reason: RejectReason::NoCandidate,
            };
        }

        let now = Instant::now();
        let mut inner = self.lock();

        let mut best: Option<(f64, Option<Instant>, String)> = None;
        for peer_id in usable {
            let state = inner.peers.entry((*peer_id).clone()).or_default();

            if state.circuit_broken_until.is_some_and(|until| until > now) {
                continue;
            }
            if state.in_flight >= self.config.max_concurrent_jobs_per_peer {
                continue;
            }

            let score = self.score(state);
            let candidate = (score, state.last_assigned_at, peer_id.clone());
            let better = match &best {
                None => true,
                Some((best_score, best_assigned, _)) => {
                    score < *best_score
                        // Tie-break: least-recently-assigned first; never
                        // assigned counts as oldest.
                        || (score == *best_score && is_older(state.last_assigned_at, *best_assigned))
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let Some((score, _, peer_id)) = best else {
            return ScheduleOutcome::Rejected {
                reason: RejectReason::PeersSaturated,
            };
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        if let Some(state) = inner.peers.get_mut(&peer_id) {
            state.in_flight = state.in_flight.saturating_add(1);
            state.last_assigned_at = Some(now);
        }
        inner.jobs.insert(job_id.clone(), peer_id.clone());

        debug!(relay_id = %job.relay_id, peer_id = %peer_id, score, "job assigned");

        ScheduleOutcome::Assigned { job_id, peer_id }
    }

    /// Report a job finished cleanly. Frees the slot and decays the peer's
    /// failure rate toward zero.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownJob`] for an untracked job id.
    pub fn acknowledge(&self, job_id: &str, outcome: &str) -> Result<(), DispatchError> {
        let mut inner = self.lock();
        let peer_id = inner
            .jobs
            .remove(job_id)
            .ok_or_else(|| DispatchError::UnknownJob {
                job_id: job_id.to_owned(),
            })?;

        if let Some(state) = inner.peers.get_mut(&peer_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.consecutive_failures = 0;
            state.failure_rate *= 0.7;
        }
        debug!(job_id = %job_id, peer_id = %peer_id, outcome = %outcome, "job acknowledged");
        Ok(())
    }

    /// Report a job failed. Frees the slot, raises the peer's failure rate,
    /// and opens the circuit after enough consecutive failures.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownJob`] for an untracked job id.
    pub fn fail(&self, job_id: &str, reason: &str) -> Result<(), DispatchError> {
        let mut inner = self.lock();
        let peer_id = inner
            .jobs
            .remove(job_id)
            .ok_or_else(|| DispatchError::UnknownJob {
                job_id: job_id.to_owned(),
            })?;

        if let Some(state) = inner.peers.get_mut(&peer_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.failure_rate = state.failure_rate * 0.7 + 0.3;

            if state.consecutive_failures >= self.config.circuit_breaker_threshold {
                state.circuit_broken_until =
                    Some(Instant::now() + self.config.circuit_breaker_duration);
                warn!(
                    peer_id = %peer_id,
                    consecutive_failures = state.consecutive_failures,
                    duration_ms = self.config.circuit_breaker_duration.as_millis() as u64,
                    reason = %reason,
                    "peer circuit opened"
                );
            }
        }
        Ok(())
    }

    /// Overwrite a peer's last-known metrics from its heartbeat.
    ///
    /// A circuit-open peer whose reported failure rate has dropped below
    /// `max_failure_rate` is restored and its failure counter cleared.
    pub fn report_peer_metrics(&self, peer_id: &str, report: &PeerMetricsReport) {
        let mut inner = self.lock();
        let state = inner.peers.entry(peer_id.to_owned()).or_default();

        if let Some(latency) = report.latency_ms {
            state.latency_ms = latency;
        }
        if let Some(lag) = report.hyperbee_lag {
            state.hyperbee_lag = lag;
        }
        if let Some(rate) = report.failure_rate {
            state.failure_rate = rate;
        }
        if !report.extra.is_empty() {
            debug!(peer_id = %peer_id, extra = ?report.extra.keys().collect::<Vec<_>>(),
                "ignoring unscored peer metrics");
        }

        if state.circuit_broken_until.is_some() && state.failure_rate < self.config.max_failure_rate
        {
            state.circuit_broken_until = None;
            state.consecutive_failures = 0;
            debug!(peer_id = %peer_id, "peer circuit restored by healthy metrics");
        }
    }

    /// Number of jobs currently in flight across all peers.
    #[must_use]
    pub fn jobs_in_flight(&self) -> usize {
        self.lock().jobs.len()
    }

    fn score(&self, state: &PeerState) -> f64 {
        let lag_penalty = if state.hyperbee_lag > self.config.reassign_on_lag_blocks {
            state.hyperbee_lag as f64
        } else {
            0.0
        };
        state.latency_ms * self.config.weight_latency
            + f64::from(state.in_flight) * self.config.weight_in_flight
            + state.failure_rate * self.config.weight_failure
            + lag_penalty
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("dispatcher mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `a` is strictly older than `b`, with "never assigned" counting as oldest.
fn is_older(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (None, Some(_)) => true,
        (Some(x), Some(y)) => x < y,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn job(peers: &[&str]) -> JobRequest {
        JobRequest {
            relay_id: "relay-1".to_owned(),
            peers: peers.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    fn metrics(latency_ms: f64) -> PeerMetricsReport {
        PeerMetricsReport {
            latency_ms: Some(latency_ms),
            ..PeerMetricsReport::default()
        }
    }

    fn assigned_peer(outcome: &ScheduleOutcome) -> &str {
        match outcome {
            ScheduleOutcome::Assigned { peer_id, .. } => peer_id,
            ScheduleOutcome::Rejected { reason } => {
                unreachable!("expected assignment, got {reason:?}")
            }
        }
    }

    #[test]
    fn empty_peer_list_rejects_no_peers() {
        let dispatcher = Dispatcher::default();
        let outcome = dispatcher.schedule(&job(&[]));
        assert!(matches!(
            outcome,
            ScheduleOutcome::Rejected {
                reason: RejectReason::NoPeers
            }
        ));
    }

    #[test]
    fn saturated_peer_loses_to_slower_idle_peer() {
        // p1: latency 50, idle. p2: latency 20 but already at max in-flight.
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics("p1", &metrics(50.0));
        dispatcher.report_peer_metrics("p2", &metrics(20.0));

        // Fill p2 to max_concurrent (3) via jobs that only list p2.
        for _ in 0..3 {
            let outcome = dispatcher.schedule(&job(&["p2"]));
            assert_eq!(assigned_peer(&outcome), "p2");
        }

        let outcome = dispatcher.schedule(&job(&["p1", "p2"]));
        assert_eq!(assigned_peer(&outcome), "p1");
    }

    #[test]
    fn lower_latency_wins_when_both_idle() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics("fast", &metrics(10.0));
        dispatcher.report_peer_metrics("slow", &metrics(90.0));

        let outcome = dispatcher.schedule(&job(&["slow", "fast"]));
        assert_eq!(assigned_peer(&outcome), "fast");
    }

    #[test]
    fn circuit_opens_after_threshold_failures_and_rejects() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics("p1", &metrics(10.0));

        for _ in 0..5 {
            let outcome = dispatcher.schedule(&job(&["p1"]));
            let ScheduleOutcome::Assigned { job_id, .. } = outcome else {
                unreachable!("schedule should assign before the circuit opens")
            };
            dispatcher.fail(&job_id, "timeout").unwrap();
        }

        let outcome = dispatcher.schedule(&job(&["p1"]));
        assert!(matches!(
            outcome,
            ScheduleOutcome::Rejected {
                reason: RejectReason::PeersSaturated
            }
        ));
        assert_eq!(RejectReason::PeersSaturated.as_slug(), "peers-saturated");
    }

    #[test]
    fn healthy_metrics_restore_an_open_circuit() {
        let dispatcher = Dispatcher::default();
        for _ in 0..5 {
            let ScheduleOutcome::Assigned { job_id, .. } = dispatcher.schedule(&job(&["p1"]))
            else {
                unreachable!()
            };
            dispatcher.fail(&job_id, "timeout").unwrap();
        }
        assert!(matches!(
            dispatcher.schedule(&job(&["p1"])),
            ScheduleOutcome::Rejected { .. }
        ));

        // Heartbeat reports the peer healthy again.
        dispatcher.report_peer_metrics(
            "p1",
            &PeerMetricsReport {
                latency_ms: Some(15.0),
                failure_rate: Some(0.1),
                ..PeerMetricsReport::default()
            },
        );

        assert!(matches!(
            dispatcher.schedule(&job(&["p1"])),
            ScheduleOutcome::Assigned { .. }
        ));
    }

    #[test]
    fn acknowledge_decays_failure_rate() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics(
            "p1",
            &PeerMetricsReport {
                failure_rate: Some(1.0),
                ..PeerMetricsReport::default()
            },
        );

        let ScheduleOutcome::Assigned { job_id, .. } = dispatcher.schedule(&job(&["p1"])) else {
            unreachable!()
        };
        dispatcher.acknowledge(&job_id, "completed").unwrap();

        // rate 1.0 → 0.7: with weight 500 the score drops accordingly.
        dispatcher.report_peer_metrics("p2", &metrics(0.0));
        // p2 has rate 0 → score 0; p1 has 0.7·500 = 350. p2 wins.
        let outcome = dispatcher.schedule(&job(&["p1", "p2"]));
        assert_eq!(assigned_peer(&outcome), "p2");
    }

    #[test]
    fn lag_beyond_threshold_penalizes_score() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics(
            "lagging",
            &PeerMetricsReport {
                latency_ms: Some(1.0),
                hyperbee_lag: Some(10_000),
                ..PeerMetricsReport::default()
            },
        );
        dispatcher.report_peer_metrics("current", &metrics(200.0));

        let outcome = dispatcher.schedule(&job(&["lagging", "current"]));
        assert_eq!(assigned_peer(&outcome), "current");
    }

    #[test]
    fn lag_below_threshold_is_free() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics(
            "slightly-behind",
            &PeerMetricsReport {
                latency_ms: Some(10.0),
                hyperbee_lag: Some(400),
                ..PeerMetricsReport::default()
            },
        );
        dispatcher.report_peer_metrics("ahead", &metrics(50.0));

        let outcome = dispatcher.schedule(&job(&["slightly-behind", "ahead"]));
        assert_eq!(assigned_peer(&outcome), "slightly-behind");
    }

    #[test]
    fn tie_break_prefers_least_recently_assigned() {
        let dispatcher = Dispatcher::default();
        dispatcher.report_peer_metrics("a", &metrics(10.0));
        dispatcher.report_peer_metrics("b", &metrics(10.0));

        // First assignment goes to one of them; complete it so scores equalize.
        let ScheduleOutcome::Assigned { job_id, peer_id } = dispatcher.schedule(&job(&["a", "b"]))
        else {
            unreachable!()
        };
        dispatcher.acknowledge(&job_id, "completed").unwrap();

        // Next assignment must go to the other peer.
        let outcome = dispatcher.schedule(&job(&["a", "b"]));
        assert_ne!(assigned_peer(&outcome), peer_id);
    }

    #[test]
    fn feedback_on_unknown_job_errors() {
        let dispatcher = Dispatcher::default();
        assert!(dispatcher.acknowledge("nope", "completed").is_err());
        assert!(dispatcher.fail("nope", "whatever").is_err());
    }

    #[test]
    fn never_assigns_beyond_concurrency_cap() {
        let dispatcher = Dispatcher::default();
        for _ in 0..3 {
            assert!(matches!(
                dispatcher.schedule(&job(&["only"])),
                ScheduleOutcome::Assigned { .. }
            ));
        }
        assert!(matches!(
            dispatcher.schedule(&job(&["only"])),
            ScheduleOutcome::Rejected {
                reason: RejectReason::PeersSaturated
            }
        ));
        assert_eq!(dispatcher.jobs_in_flight(), 3);
    }
}
