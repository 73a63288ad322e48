//! Recording the outcome of reconciliations
use std::{fmt, sync::Arc, time::Duration};

use ahash::AHashMap;
use parking_lot::RwLock;

/// How the processing of a key ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The handler succeeded
    Processed,
    /// The handler failed and the key was queued again
    Retried,
    /// The handler failed and the key ran out of retries
    Dropped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Processed => "processed",
            Outcome::Retried => "retried",
            Outcome::Dropped => "dropped",
        })
    }
}

/// Sink for controller measurements
///
/// A controller reports exactly one outcome for every handler invocation.
pub trait MetricsRecorder: Send + Sync {
    /// Count the outcome of handling `key`
    fn observe_outcome(&self, controller: &str, outcome: Outcome, key: &str);

    /// Record how long the handler took for one key
    fn observe_duration(&self, controller: &str, outcome: Outcome, elapsed: Duration);
}

impl<M: MetricsRecorder + ?Sized> MetricsRecorder for Arc<M> {
    fn observe_outcome(&self, controller: &str, outcome: Outcome, key: &str) {
        (**self).observe_outcome(controller, outcome, key);
    }

    fn observe_duration(&self, controller: &str, outcome: Outcome, elapsed: Duration) {
        (**self).observe_duration(controller, outcome, elapsed);
    }
}

/// Discards all measurements
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn observe_outcome(&self, _controller: &str, _outcome: Outcome, _key: &str) {}

    fn observe_duration(&self, _controller: &str, _outcome: Outcome, _elapsed: Duration) {}
}

/// Totals for one controller and outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutcomeStats {
    /// Number of keys that ended this way
    pub count: u64,
    /// Time spent in the handler for those keys
    pub total_duration: Duration,
}

/// In-memory counters, readable through [`Metrics::snapshot`]
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    stats: Arc<RwLock<AHashMap<(String, Outcome), OutcomeStats>>>,
}

impl Metrics {
    /// Empty counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals for `controller` and `outcome`
    #[must_use]
    pub fn get(&self, controller: &str, outcome: Outcome) -> OutcomeStats {
        self.stats
            .read()
            .get(&(controller.to_string(), outcome))
            .copied()
            .unwrap_or_default()
    }

    /// All totals recorded so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Outcome, OutcomeStats)> {
        self.stats
            .read()
            .iter()
            .map(|((controller, outcome), stats)| (controller.clone(), *outcome, *stats))
            .collect()
    }
}

impl MetricsRecorder for Metrics {
    fn observe_outcome(&self, controller: &str, outcome: Outcome, _key: &str) {
        self.stats
            .write()
            .entry((controller.to_string(), outcome))
            .or_default()
            .count += 1;
    }

    fn observe_duration(&self, controller: &str, outcome: Outcome, elapsed: Duration) {
        self.stats
            .write()
            .entry((controller.to_string(), outcome))
            .or_default()
            .total_duration += elapsed;
    }
}
