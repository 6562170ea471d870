#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_test;

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, gauge, IntoF64};
use serde::Serialize;
use tbft_protobuf::consensus::Step;

use crate::types::{Height, Round};

pub struct MetricCounter {
    name: &'static str,
    description: &'static str,
}

impl MetricCounter {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }

    pub fn register(&self) {
        counter!(self.name).absolute(0);
        describe_counter!(self.name, self.description);
    }

    pub fn increment(&self, value: u64) {
        counter!(self.name).increment(value);
    }

    pub fn absolute(&self, value: u64) {
        counter!(self.name).absolute(value);
    }
}

pub struct LabeledMetricCounter {
    name: &'static str,
    description: &'static str,
    label_permutations: &'static [&'static [(&'static str, &'static str)]],
}

impl LabeledMetricCounter {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        label_permutations: &'static [&'static [(&'static str, &'static str)]],
    ) -> Self {
        Self { name, description, label_permutations }
    }

    pub fn register(&self) {
        self.label_permutations.iter().map(|&slice| slice.to_vec()).for_each(|labels| {
            counter!(self.name, &labels).absolute(0);
        });
        describe_counter!(self.name, self.description);
    }

    pub fn increment(&self, value: u64, labels: &[(&'static str, &'static str)]) {
        counter!(self.name, labels).increment(value);
    }
}

pub struct MetricGauge {
    name: &'static str,
    description: &'static str,
}

impl MetricGauge {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }

    pub fn register(&self) {
        gauge!(self.name).set(0.0);
        describe_gauge!(self.name, self.description);
    }

    pub fn set<T: IntoF64>(&self, value: T) {
        gauge!(self.name).set(value);
    }
}

pub const CONSENSUS_HEIGHT: MetricCounter =
    MetricCounter::new("tbft_consensus_height", "The height consensus is working to decide");
pub const CONSENSUS_ROUND: MetricGauge =
    MetricGauge::new("tbft_consensus_round", "The round of the state machine");
pub const CONSENSUS_BLOCKS_COMMITTED: MetricCounter = MetricCounter::new(
    "tbft_consensus_blocks_committed",
    "The number of blocks decided and handed to the ledger",
);
pub const CONSENSUS_PROPOSALS_RECEIVED: MetricCounter = MetricCounter::new(
    "tbft_consensus_proposals_received",
    "The number of proposals received from peers",
);
pub const CONSENSUS_PROPOSALS_INVALID: MetricCounter = MetricCounter::new(
    "tbft_consensus_proposals_invalid",
    "The number of proposals rejected or failing verification",
);
pub const CONSENSUS_VOTES_REJECTED: MetricCounter = MetricCounter::new(
    "tbft_consensus_votes_rejected",
    "The number of votes dropped as stale, unauthenticated or unknown",
);
pub const CONSENSUS_CONFLICTING_VOTES: MetricCounter = MetricCounter::new(
    "tbft_consensus_conflicting_votes",
    "The number of equivocating votes received",
);
pub const CONSENSUS_TIMEOUTS: LabeledMetricCounter = LabeledMetricCounter::new(
    "tbft_consensus_timeouts",
    "The number of round timeouts handled, by the step they move to",
    CONSENSUS_TIMEOUT_LABELS,
);

pub const LABEL_NAME_TIMEOUT_STEP: &str = "step";

const CONSENSUS_TIMEOUT_LABELS: &[&[(&str, &str)]] = &[
    &[(LABEL_NAME_TIMEOUT_STEP, "prevote")],
    &[(LABEL_NAME_TIMEOUT_STEP, "precommit")],
    &[(LABEL_NAME_TIMEOUT_STEP, "commit")],
];

pub(crate) fn register_metrics() {
    CONSENSUS_HEIGHT.register();
    CONSENSUS_ROUND.register();
    CONSENSUS_BLOCKS_COMMITTED.register();
    CONSENSUS_PROPOSALS_RECEIVED.register();
    CONSENSUS_PROPOSALS_INVALID.register();
    CONSENSUS_VOTES_REJECTED.register();
    CONSENSUS_CONFLICTING_VOTES.register();
    CONSENSUS_TIMEOUTS.register();
}

/// Entry times of the steps of every round of a height.
#[derive(Debug)]
pub(crate) struct HeightMetrics {
    height: Height,
    enter_new_height: Instant,
    rounds: BTreeMap<Round, BTreeMap<Step, Instant>>,
}

#[derive(Debug, Serialize)]
struct RoundCost {
    height: Height,
    round: Round,
    since_new_height_ms: u64,
    /// Milliseconds from entering the round to entering each step.
    steps: BTreeMap<&'static str, u64>,
}

impl HeightMetrics {
    pub(crate) fn new(height: Height) -> Self {
        Self { height, enter_new_height: Instant::now(), rounds: BTreeMap::new() }
    }

    pub(crate) fn set_enter_time(&mut self, round: Round, step: Step) {
        self.rounds.entry(round).or_default().entry(step).or_insert_with(Instant::now);
    }

    /// A JSON summary of where the time of `round` went.
    pub(crate) fn round_summary(&self, round: Round) -> String {
        let steps = self.rounds.get(&round);
        let round_start = steps
            .and_then(|steps| steps.values().min().copied())
            .unwrap_or(self.enter_new_height);
        let cost = RoundCost {
            height: self.height,
            round,
            since_new_height_ms: millis(round_start.saturating_duration_since(self.enter_new_height)),
            steps: steps
                .into_iter()
                .flatten()
                .map(|(step, entered)| {
                    (<&'static str>::from(*step), millis(entered.saturating_duration_since(round_start)))
                })
                .collect(),
        };
        serde_json::to_string(&cost).unwrap_or_default()
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
