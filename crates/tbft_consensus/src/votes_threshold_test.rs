use rstest::rstest;

use crate::votes_threshold::{VotesThreshold, QUORUM};

#[test]
#[should_panic]
fn votes_threshold_denominator_zero() {
    let _ = VotesThreshold::new(1, 0);
}

#[test]
#[should_panic]
fn votes_threshold_numerator_greater() {
    // Denominator must be greater than or equal to numerator
    let _ = VotesThreshold::new(2, 1);
}

#[test]
fn votes_threshold_is_met() {
    assert!(QUORUM.is_met(3, 4)); // 3 out of 4 votes
    assert!(QUORUM.is_met(5, 6)); // 5 out of 6 votes
    assert!(QUORUM.is_met(10, 10)); // All votes in favor

    // Test cases where the threshold is not met
    assert!(!QUORUM.is_met(1, 3)); // 1 out of 3 votes
    assert!(!QUORUM.is_met(2, 3)); // 2 out of 3 votes (not enough, must be above threshold)
    assert!(!QUORUM.is_met(2, 5)); // 2 out of 5 votes
    assert!(!QUORUM.is_met(0, 0));
}

#[rstest]
#[case(1, 1)]
#[case(3, 3)]
#[case(4, 3)]
#[case(6, 5)]
#[case(7, 5)]
#[case(10, 7)]
fn min_votes_matches_is_met(#[case] total: u64, #[case] expected: u64) {
    assert_eq!(QUORUM.min_votes(total), expected);
    assert!(QUORUM.is_met(expected, total));
    assert!(!QUORUM.is_met(expected - 1, total));
}
