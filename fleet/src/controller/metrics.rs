use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
};

/// Outcome of a liveness check.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Verdict {
    Working,
    NoBlock,
    Stalled,
    Failed,
}

impl Verdict {
    pub fn of(result: &Result<(), crate::Error>) -> Self {
        match result {
            Ok(()) => Verdict::Working,
            Err(crate::Error::NoBlockEverProduced { .. }) => Verdict::NoBlock,
            Err(crate::Error::StalledAfterProgress { .. }) => Verdict::Stalled,
            Err(_) => Verdict::Failed,
        }
    }
}

/// Label for verdict metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerdictLabel {
    pub verdict: Verdict,
}

/// Metrics for the [super::Fleet]
pub struct Metrics {
    /// Number of node containers started
    pub nodes_started: Counter,
    /// Number of node containers stopped
    pub nodes_stopped: Counter,
    /// Number of membership votes cast
    pub proposals: Counter,
    /// Number of liveness checks by verdict
    pub verdicts: Family<VerdictLabel, Counter>,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let nodes_started = Counter::default();
        context.register(
            "nodes_started",
            "Number of node containers started",
            nodes_started.clone(),
        );
        let nodes_stopped = Counter::default();
        context.register(
            "nodes_stopped",
            "Number of node containers stopped",
            nodes_stopped.clone(),
        );
        let proposals = Counter::default();
        context.register(
            "proposals",
            "Number of membership votes cast",
            proposals.clone(),
        );
        let verdicts = Family::default();
        context.register(
            "verdicts",
            "Number of liveness checks by verdict",
            verdicts.clone(),
        );
        Self {
            nodes_started,
            nodes_stopped,
            proposals,
            verdicts,
        }
    }

    pub fn verdict(&self, result: &Result<(), crate::Error>) {
        self.verdicts
            .get_or_create(&VerdictLabel {
                verdict: Verdict::of(result),
            })
            .inc();
    }
}
