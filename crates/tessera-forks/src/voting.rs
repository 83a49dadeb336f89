//! Stake-weighted voting for the candidate fork.
//!
//! Every epoch boundary records, per candidate fork id, the share of stake
//! that voted for it. A candidate activates once one of its thresholds has
//! been met for enough consecutive epochs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_types::{Amount, Epoch};

use crate::config::{CandidateForkId, MAX_STAKE, Threshold};

/// Results below this stake share (10.00%) are not recorded.
pub const MIN_STORED_STAKE: u16 = 1_000;

/// The stake share that voted for a candidate fork, as of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkVotingResult {
    pub epoch: Epoch,
    pub candidate_fork_id: CandidateForkId,
    /// Basis points of the total stake.
    pub stake_percentage: u16,
}

impl ForkVotingResult {
    pub fn new(epoch: Epoch, candidate_fork_id: CandidateForkId, stake_percentage: u16) -> Self {
        Self {
            epoch,
            candidate_fork_id,
            stake_percentage,
        }
    }
}

// ============================================================================
// Consecutive-Epoch Counters
// ============================================================================

fn initial_counters(thresholds: &[Threshold], stake_percentage: u16) -> Vec<u64> {
    thresholds
        .iter()
        .map(|t| u64::from(t.is_met_by(stake_percentage)))
        .collect()
}

/// Advances each counter by one observed epoch.
///
/// A consecutive epoch increments a passing counter and zeroes a failing
/// one. After a gap, counting restarts from the observed epoch alone.
pub(crate) fn advance_counters(
    counters: &mut [u64],
    thresholds: &[Threshold],
    stake_percentage: u16,
    consecutive: bool,
) {
    for (counter, threshold) in counters.iter_mut().zip(thresholds) {
        let passes = threshold.is_met_by(stake_percentage);
        *counter = match (consecutive, passes) {
            (_, false) => 0,
            (true, true) => counter.saturating_add(1),
            (false, true) => 1,
        };
    }
}

/// Counts, per threshold, the consecutive epochs ending at `at_epoch` during
/// which the threshold was met.
///
/// `results` must be ordered by epoch. If the last result read is not for
/// `at_epoch` the history is stale and every counter is zero.
pub fn calculate_thresholds_passing_epochs<I>(
    thresholds: &[Threshold],
    at_epoch: Epoch,
    results: I,
) -> Vec<u64>
where
    I: IntoIterator<Item = ForkVotingResult>,
{
    let zeros = vec![0; thresholds.len()];
    let mut results = results.into_iter();

    let Some(mut last) = results.next() else {
        return zeros;
    };
    let mut counters = initial_counters(thresholds, last.stake_percentage);

    while last.epoch <= at_epoch {
        let Some(next) = results.next() else {
            break;
        };
        let consecutive = next.epoch == last.epoch.next();
        advance_counters(&mut counters, thresholds, next.stake_percentage, consecutive);
        last = next;
    }

    if last.epoch == at_epoch {
        counters
    } else {
        zeros
    }
}

/// Whether any threshold's counter has reached its required epochs.
pub fn any_threshold_passed(thresholds: &[Threshold], counters: &[u64]) -> bool {
    thresholds
        .iter()
        .zip(counters)
        .any(|(threshold, count)| *count >= threshold.epochs_before_enacted)
}

// ============================================================================
// Epoch Tally
// ============================================================================

/// A member of the validator set closing an epoch, and what it voted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorVote {
    pub power: Amount,
    pub vote: Option<CandidateForkId>,
}

impl ValidatorVote {
    pub fn new(power: Amount, vote: Option<CandidateForkId>) -> Self {
        Self { power, vote }
    }
}

/// Tallies the votes of the validator set closing `epoch`.
///
/// Results are stamped with `epoch + 1`, the epoch they decide on, and
/// ordered by candidate id. Candidates below [`MIN_STORED_STAKE`] are
/// dropped.
pub fn tally_fork_votes<I>(epoch: Epoch, validators: I) -> Vec<ForkVotingResult>
where
    I: IntoIterator<Item = ValidatorVote>,
{
    let mut total = 0u128;
    let mut per_candidate: BTreeMap<CandidateForkId, u128> = BTreeMap::new();

    for validator in validators {
        let power = validator.power.as_u128();
        total = total.saturating_add(power);
        if let Some(id) = validator.vote {
            let entry = per_candidate.entry(id).or_default();
            *entry = entry.saturating_add(power);
        }
    }

    if total == 0 {
        return Vec::new();
    }

    let next_epoch = epoch.next();
    per_candidate
        .into_iter()
        .map(|(id, power)| {
            ForkVotingResult::new(next_epoch, id, stake_share(power, total))
        })
        .filter(|result| result.stake_percentage >= MIN_STORED_STAKE)
        .collect()
}

fn stake_share(power: u128, total: u128) -> u16 {
    let scale = u128::from(MAX_STAKE);
    let share = match power.checked_mul(scale) {
        Some(scaled) => scaled / total,
        None => power / (total / scale),
    };
    share.min(scale) as u16
}
