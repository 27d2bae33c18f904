//! Deterministic winner selection across worker outcomes.
//!
//! `compare` is a strict total order over outcomes with distinct worker ids.
//! Keys, most significant first: PASS before anything else, fewer failing
//! tests, smaller diff, fewer files, smaller patch hash, lower worker id.

use std::cmp::Ordering;

use crate::core::outcome::{OutcomeStatus, TaskOutcome};

/// `Ordering::Less` means `a` ranks better than `b`.
///
/// Only PASS is ranked above the rest. When no worker passes, a gate rejection
/// or security violation with no tests run and no diff can outrank a
/// FAIL_TESTS outcome on the count and size keys.
pub fn compare(a: &TaskOutcome, b: &TaskOutcome) -> Ordering {
    status_rank(a.status)
        .cmp(&status_rank(b.status))
        .then_with(|| a.failing_test_count.cmp(&b.failing_test_count))
        .then_with(|| a.patch_diff_size.cmp(&b.patch_diff_size))
        .then_with(|| a.files_touched.len().cmp(&b.files_touched.len()))
        .then_with(|| a.patch_hash.cmp(&b.patch_hash))
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

// Non-PASS statuses share a rank; the remaining keys order them.
fn status_rank(status: OutcomeStatus) -> u8 {
    match status {
        OutcomeStatus::Pass => 0,
        OutcomeStatus::FailTests
        | OutcomeStatus::RejectedByGate
        | OutcomeStatus::SecurityViolation
        | OutcomeStatus::Error
        | OutcomeStatus::Timeout => 1,
    }
}

/// Best outcome, independent of the order outcomes arrive in.
pub fn select_winner(outcomes: &[TaskOutcome]) -> Option<&TaskOutcome> {
    outcomes.iter().min_by(|a, b| compare(a, b))
}
