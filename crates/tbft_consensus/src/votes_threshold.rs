#[cfg(test)]
#[path = "votes_threshold_test.rs"]
mod votes_threshold_test;

/// Represents a threshold for the number of votes (out of total votes) required to meet a quorum.
/// For example, a threshold of 2/3 means that more than 2/3 of the total votes must be in favor,
/// i.e. at least `⌊2n/3⌋ + 1` of `n` votes.
/// If the total number of votes is zero, the threshold is not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VotesThreshold {
    numerator: u64,
    denominator: u64,
}

/// The byzantine quorum: more than 2/3 of the validators.
pub const QUORUM: VotesThreshold = VotesThreshold { numerator: 2, denominator: 3 };

impl VotesThreshold {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        assert!(denominator > 0, "Denominator must be greater than zero");
        assert!(denominator >= numerator, "Denominator must be greater than or equal to numerator");
        Self { numerator, denominator }
    }

    pub fn is_met(&self, amount: u64, total: u64) -> bool {
        amount.saturating_mul(self.denominator) > total.saturating_mul(self.numerator)
    }

    /// The smallest amount out of `total` that meets the threshold.
    pub fn min_votes(&self, total: u64) -> u64 {
        total.saturating_mul(self.numerator) / self.denominator + 1
    }
}
