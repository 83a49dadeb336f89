//! Fork definitions.
//!
//! A fork is a named rule set. Fixed forks activate at a configured epoch;
//! the single optional candidate fork activates once enough validator stake
//! has voted for it for long enough within its epoch window.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use tessera_types::{Epoch, Hash};

use crate::error::ForkConfigError;

/// Stake percentages are expressed in basis points of the total stake.
pub const MAX_STAKE: u16 = 10_000;

// ============================================================================
// Voting Thresholds
// ============================================================================

/// A stake level that must be sustained for a number of consecutive epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Threshold {
    /// Required stake in basis points (`0..=10_000`).
    pub required_stake: u16,
    /// Consecutive epochs the stake must be met.
    pub epochs_before_enacted: u64,
}

impl Threshold {
    pub const fn new(required_stake: u16, epochs_before_enacted: u64) -> Self {
        Self {
            required_stake,
            epochs_before_enacted,
        }
    }

    pub fn is_met_by(&self, stake_percentage: u16) -> bool {
        stake_percentage >= self.required_stake
    }

    fn validate(&self) -> Result<(), ForkConfigError> {
        if self.required_stake == 0
            || self.required_stake > MAX_STAKE
            || self.epochs_before_enacted == 0
        {
            return Err(ForkConfigError::InvalidThreshold {
                required_stake: self.required_stake,
                epochs: self.epochs_before_enacted,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Candidate Schedule
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSchedule {
    pub min_epoch: Epoch,
    pub max_epoch: Epoch,
    pub thresholds: Vec<Threshold>,
}

impl CandidateSchedule {
    pub fn new(min_epoch: Epoch, max_epoch: Epoch, thresholds: Vec<Threshold>) -> Self {
        Self {
            min_epoch,
            max_epoch,
            thresholds,
        }
    }

    /// The largest `epochs_before_enacted` across all thresholds.
    pub fn longest_threshold_epochs(&self) -> u64 {
        self.thresholds
            .iter()
            .map(|t| t.epochs_before_enacted)
            .max()
            .unwrap_or(0)
    }

    /// Whether the candidate may activate at `epoch`.
    pub fn window_contains(&self, epoch: Epoch) -> bool {
        epoch >= self.min_epoch && epoch <= self.max_epoch
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), ForkConfigError> {
        if self.min_epoch > self.max_epoch {
            return Err(ForkConfigError::InvalidCandidateWindow {
                min_epoch: self.min_epoch,
                max_epoch: self.max_epoch,
            });
        }
        if self.thresholds.is_empty() {
            return Err(ForkConfigError::MissingThresholds(name.to_string()));
        }
        self.thresholds.iter().try_for_each(Threshold::validate)
    }
}

/// Identifies a candidate fork in validator votes.
///
/// Derived from the fork's name and its full schedule, so changing either
/// yields a fresh id and previously cast votes stop counting.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateForkId(Hash);

impl CandidateForkId {
    pub fn compute(name: &str, schedule: &CandidateSchedule) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&schedule.min_epoch.as_u64().to_le_bytes());
        hasher.update(&schedule.max_epoch.as_u64().to_le_bytes());
        hasher.update(&(schedule.thresholds.len() as u64).to_le_bytes());
        for threshold in &schedule.thresholds {
            hasher.update(&threshold.required_stake.to_le_bytes());
            hasher.update(&threshold.epochs_before_enacted.to_le_bytes());
        }
        Self(Hash::from_bytes(*hasher.finalize().as_bytes()))
    }

    pub fn from_hash(hash: Hash) -> Self {
        Self(hash)
    }

    pub fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl Debug for CandidateForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CandidateForkId({})", self.0)
    }
}

impl Display for CandidateForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// ============================================================================
// Fork Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkKind {
    Fixed { epoch: Epoch },
    Candidate(CandidateSchedule),
}

/// A named fork carrying the rule set `R` it activates.
#[derive(Clone)]
pub struct ForkConfig<R> {
    name: String,
    kind: ForkKind,
    rules: R,
}

impl<R> ForkConfig<R> {
    pub fn fixed(name: impl Into<String>, epoch: Epoch, rules: R) -> Self {
        Self {
            name: name.into(),
            kind: ForkKind::Fixed { epoch },
            rules,
        }
    }

    pub fn candidate(name: impl Into<String>, schedule: CandidateSchedule, rules: R) -> Self {
        Self {
            name: name.into(),
            kind: ForkKind::Candidate(schedule),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ForkKind {
        &self.kind
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// The activation epoch of a fixed fork.
    pub fn fixed_epoch(&self) -> Option<Epoch> {
        match self.kind {
            ForkKind::Fixed { epoch } => Some(epoch),
            ForkKind::Candidate(_) => None,
        }
    }

    pub fn candidate_schedule(&self) -> Option<&CandidateSchedule> {
        match &self.kind {
            ForkKind::Fixed { .. } => None,
            ForkKind::Candidate(schedule) => Some(schedule),
        }
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.kind, ForkKind::Candidate(_))
    }

    pub fn candidate_id(&self) -> Option<CandidateForkId> {
        self.candidate_schedule()
            .map(|schedule| CandidateForkId::compute(&self.name, schedule))
    }
}

impl<R> Debug for ForkConfig<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
