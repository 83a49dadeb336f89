//! The fork registry.
//!
//! [`Forks`] holds the immutable fork schedule: an ordered list of fixed
//! forks followed by at most one candidate fork. It decides, at each epoch
//! boundary, whether the next fork activates, and on startup reconciles the
//! configured schedule with the activations already recorded in a
//! [`ForksEpochStore`].
//!
//! # Activation
//!
//! Each fixed fork except the last is linked to its successor, which
//! activates once the ledger reaches the successor's epoch. The last fixed
//! fork is linked to the candidate, which activates when a voting threshold
//! has been sustained within the candidate's epoch window. A fork can only
//! follow the fork it is linked from, so forks always activate in order.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use tessera_types::Epoch;
use tracing::{debug, error, info};

use crate::config::{CandidateForkId, CandidateSchedule, ForkConfig, ForkKind};
use crate::error::{ForkConfigError, ForkConsistencyError, ForksError};
use crate::store::{CommittedReader, ForksEpochStore};
use crate::voting::{
    ForkVotingResult, advance_counters, any_threshold_passed, calculate_thresholds_passing_epochs,
};

// ============================================================================
// Epoch Boundary
// ============================================================================

/// What the registry needs to know about a committed ledger proof.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochBoundary {
    /// Epoch of the proof.
    pub epoch: Epoch,
    /// Whether the proof closes its epoch (carries the next validator set).
    pub ends_epoch: bool,
    /// Candidate voting results tallied at this boundary.
    pub voting_results: Vec<ForkVotingResult>,
}

impl EpochBoundary {
    /// A proof that closes `epoch` with the given voting results.
    pub fn end_of(epoch: Epoch, voting_results: Vec<ForkVotingResult>) -> Self {
        Self {
            epoch,
            ends_epoch: true,
            voting_results,
        }
    }

    /// A proof within `epoch` that does not change the validator set.
    pub fn within(epoch: Epoch) -> Self {
        Self {
            epoch,
            ends_epoch: false,
            voting_results: Vec::new(),
        }
    }
}

/// How the fork following a fixed fork activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextForkLink {
    /// The fixed fork at this index in the schedule.
    Fixed(usize),
    /// The candidate fork.
    Candidate,
}

// ============================================================================
// Forks
// ============================================================================

pub struct Forks<R> {
    fixed: Vec<ForkConfig<R>>,
    candidate: Option<(ForkConfig<R>, CandidateForkId)>,
    links: Vec<Option<NextForkLink>>,
}

impl<R> Forks<R> {
    /// Builds a registry, validating the schedule.
    ///
    /// Fixed forks are taken in the order given: the first must start at
    /// epoch 0 and epochs must strictly increase.
    pub fn create(configs: Vec<ForkConfig<R>>) -> Result<Self, ForkConfigError> {
        let mut names = HashSet::new();
        for config in &configs {
            if !names.insert(config.name().to_string()) {
                return Err(ForkConfigError::DuplicateName(config.name().to_string()));
            }
        }

        let mut fixed = Vec::new();
        let mut fixed_epochs = Vec::new();
        let mut candidate = None;
        for config in configs {
            match config.kind() {
                ForkKind::Fixed { epoch } => {
                    fixed_epochs.push(*epoch);
                    fixed.push(config);
                }
                ForkKind::Candidate(schedule) => {
                    if candidate.is_some() {
                        return Err(ForkConfigError::MultipleCandidates);
                    }
                    let schedule = schedule.clone();
                    candidate = Some((config, schedule));
                }
            }
        }

        let (Some(genesis), Some(&genesis_epoch)) = (fixed.first(), fixed_epochs.first()) else {
            return Err(ForkConfigError::NoFixedFork);
        };
        if genesis_epoch != Epoch::ZERO {
            return Err(ForkConfigError::GenesisNotAtZero {
                name: genesis.name().to_string(),
                epoch: genesis_epoch,
            });
        }
        for (index, pair) in fixed_epochs.windows(2).enumerate() {
            let (previous, epoch) = (pair[0], pair[1]);
            if epoch <= previous {
                return Err(ForkConfigError::NonIncreasingEpochs {
                    name: fixed[index + 1].name().to_string(),
                    epoch,
                    previous,
                });
            }
        }
        let last_fixed = fixed_epochs.last().copied().unwrap_or(Epoch::ZERO);

        let candidate = match candidate {
            Some((config, schedule)) => {
                schedule.validate(config.name())?;
                if schedule.min_epoch <= last_fixed {
                    return Err(ForkConfigError::CandidateOverlapsFixed {
                        min_epoch: schedule.min_epoch,
                        last_fixed,
                    });
                }
                let id = CandidateForkId::compute(config.name(), &schedule);
                Some((config, id))
            }
            None => None,
        };

        let links = (0..fixed.len())
            .map(|index| {
                if index + 1 < fixed.len() {
                    Some(NextForkLink::Fixed(index + 1))
                } else if candidate.is_some() {
                    Some(NextForkLink::Candidate)
                } else {
                    None
                }
            })
            .collect();

        debug!(
            fixed = fixed.len(),
            candidate = candidate.is_some(),
            "fork schedule built"
        );

        Ok(Self {
            fixed,
            candidate,
            links,
        })
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Fixed forks in schedule order, then the candidate.
    pub fn fork_configs(&self) -> impl Iterator<Item = &ForkConfig<R>> {
        self.fixed
            .iter()
            .chain(self.candidate.as_ref().map(|(config, _)| config))
    }

    pub fn genesis_fork(&self) -> &ForkConfig<R> {
        &self.fixed[0]
    }

    /// The candidate if configured, else the last fixed fork.
    pub fn newest_fork(&self) -> &ForkConfig<R> {
        match &self.candidate {
            Some((config, _)) => config,
            None => &self.fixed[self.fixed.len() - 1],
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&ForkConfig<R>> {
        self.fork_configs().find(|config| config.name() == name)
    }

    pub fn candidate_fork(&self) -> Option<&ForkConfig<R>> {
        self.candidate.as_ref().map(|(config, _)| config)
    }

    pub fn candidate_fork_id(&self) -> Option<CandidateForkId> {
        self.candidate.as_ref().map(|(_, id)| *id)
    }

    /// The link out of the named fork, if any fork follows it.
    pub fn next_fork_link(&self, name: &str) -> Option<NextForkLink> {
        let index = self.fixed.iter().position(|config| config.name() == name)?;
        self.links[index]
    }

    /// The fork active at `epoch` according to a recorded activation
    /// history.
    pub fn active_fork_at(
        &self,
        epoch: Epoch,
        stored: &BTreeMap<Epoch, String>,
    ) -> Option<&ForkConfig<R>> {
        let (_, name) = stored.range(..=epoch).next_back()?;
        self.by_name(name)
    }

    fn candidate_schedule(&self) -> Option<(&ForkConfig<R>, &CandidateSchedule, CandidateForkId)> {
        let (config, id) = self.candidate.as_ref()?;
        let schedule = config.candidate_schedule()?;
        Some((config, schedule, *id))
    }

    // ========================================================================
    // Startup Reconciliation
    // ========================================================================

    /// Reconciles the schedule with the recorded activation history.
    ///
    /// Records fixed forks the ledger has already passed and a candidate
    /// activation implied by stored votes, then checks the result is
    /// consistent with the configuration. Running it twice is a no-op.
    pub fn init<C, S>(&self, committed: &C, store: &mut S) -> Result<(), ForksError>
    where
        C: CommittedReader + ?Sized,
        S: ForksEpochStore + ?Sized,
    {
        let initial = store.stored_forks()?;
        let current = committed.last_committed_epoch().unwrap_or(Epoch::ZERO);

        info!(
            stored_forks = ?initial,
            configured_forks = ?self.fork_configs().map(ForkConfig::name).collect::<Vec<_>>(),
            current_epoch = %current,
            "forks init"
        );

        self.execute_missed_fixed_forks(&initial, current, store)?;
        self.execute_missed_candidate(&initial, store)?;

        self.sanity_check(store, current).inspect_err(|e| {
            error!(error = %e, "stored forks disagree with configuration");
        })
    }

    fn execute_missed_fixed_forks<S>(
        &self,
        initial: &BTreeMap<Epoch, String>,
        current: Epoch,
        store: &mut S,
    ) -> Result<(), ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        for config in &self.fixed {
            let Some(epoch) = config.fixed_epoch() else {
                continue;
            };
            let already_stored = initial.values().any(|name| name == config.name());
            // Epoch mismatches are left to the sanity check.
            if current >= epoch && !already_stored {
                info!(fork = config.name(), epoch = %epoch, "storing missed fixed fork");
                store.store_fork_at_epoch(epoch, config.name())?;
            }
        }
        Ok(())
    }

    fn execute_missed_candidate<S>(
        &self,
        initial: &BTreeMap<Epoch, String>,
        store: &mut S,
    ) -> Result<(), ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        let Some((config, _)) = &self.candidate else {
            return Ok(());
        };
        let name = config.name();

        let execute_epoch = self.find_execute_epoch_for_candidate(&*store)?;
        let stored_epoch = initial
            .iter()
            .find(|(_, stored)| *stored == name)
            .map(|(epoch, _)| *epoch);

        match (execute_epoch, stored_epoch) {
            (Some(computed), Some(stored)) if computed != stored => {
                Err(ForkConsistencyError::CandidateEpochMismatch {
                    name: name.to_string(),
                    computed,
                    stored,
                }
                .into())
            }
            (Some(computed), None) => {
                info!(fork = name, epoch = %computed, "storing missed candidate fork");
                store.store_fork_at_epoch(computed, name)?;
                Ok(())
            }
            (None, Some(stored)) => Err(ForkConsistencyError::CandidateWithoutVotes {
                name: name.to_string(),
                stored,
            }
            .into()),
            _ => Ok(()),
        }
    }

    fn sanity_check<S>(&self, store: &S, current: Epoch) -> Result<(), ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        let stored = store.stored_forks()?;

        for config in &self.fixed {
            let Some(epoch) = config.fixed_epoch() else {
                continue;
            };
            if epoch == Epoch::ZERO || epoch > current {
                continue;
            }
            if stored.get(&epoch).map(String::as_str) != Some(config.name()) {
                return Err(ForkConsistencyError::MissingFixedFork {
                    name: config.name().to_string(),
                    epoch,
                }
                .into());
            }
        }

        for (&epoch, name) in &stored {
            if epoch > current {
                return Err(ForkConsistencyError::StoredForkInFuture {
                    name: name.clone(),
                    epoch,
                    current,
                }
                .into());
            }

            let matches_fixed = self
                .fixed
                .iter()
                .any(|config| config.fixed_epoch() == Some(epoch) && config.name() == name);
            let matches_candidate = self
                .candidate_schedule()
                .is_some_and(|(config, schedule, _)| {
                    schedule.window_contains(epoch) && config.name() == name
                });

            if !matches_fixed && !matches_candidate {
                return Err(ForkConsistencyError::UnexpectedStoredFork {
                    name: name.clone(),
                    epoch,
                }
                .into());
            }
        }

        Ok(())
    }

    // ========================================================================
    // Candidate Voting
    // ========================================================================

    /// The first epoch in the candidate's window at which stored votes
    /// satisfy one of its thresholds.
    pub fn find_execute_epoch_for_candidate<S>(&self, store: &S) -> Result<Option<Epoch>, ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        let Some((_, schedule, id)) = self.candidate_schedule() else {
            return Ok(None);
        };

        let from = schedule
            .min_epoch
            .saturating_sub(schedule.longest_threshold_epochs());
        let to = schedule.max_epoch.next();

        let mut counters = vec![0; schedule.thresholds.len()];
        let mut previous: Option<Epoch> = None;

        for result in store.fork_voting_results(from, to, &id)? {
            let consecutive = previous.is_none_or(|epoch| epoch.next() == result.epoch);
            advance_counters(
                &mut counters,
                &schedule.thresholds,
                result.stake_percentage,
                consecutive,
            );

            if schedule.window_contains(result.epoch)
                && any_threshold_passed(&schedule.thresholds, &counters)
            {
                return Ok(Some(result.epoch));
            }
            previous = Some(result.epoch);
        }

        Ok(None)
    }

    /// Whether the candidate activates at the epoch following `boundary`.
    ///
    /// Only a boundary that closes its epoch and carries a result for the
    /// candidate can enact it. The current result is appended to the stored
    /// history before counting.
    pub fn should_candidate_fork_be_enacted<S>(
        &self,
        boundary: &EpochBoundary,
        store: &S,
    ) -> Result<bool, ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        let Some((_, schedule, id)) = self.candidate_schedule() else {
            return Ok(false);
        };
        if !boundary.ends_epoch || boundary.voting_results.is_empty() {
            return Ok(false);
        }

        let Some(current) = boundary
            .voting_results
            .iter()
            .find(|result| result.candidate_fork_id == id)
        else {
            return Ok(false);
        };

        let next_epoch = boundary.epoch.next();
        if !schedule.window_contains(next_epoch) {
            return Ok(false);
        }

        let from = next_epoch.saturating_sub(schedule.longest_threshold_epochs());
        let history = store
            .fork_voting_results(from, schedule.max_epoch, &id)?
            .chain(std::iter::once(*current));

        let counters = calculate_thresholds_passing_epochs(&schedule.thresholds, next_epoch, history);
        Ok(any_threshold_passed(&schedule.thresholds, &counters))
    }

    // ========================================================================
    // Epoch Boundary Processing
    // ========================================================================

    /// Runs the link out of `current_fork` against a committed boundary.
    ///
    /// Records the boundary's voting results, and if the next fork
    /// activates, records it at `boundary.epoch + 1` and returns it.
    pub fn process_epoch_boundary<S>(
        &self,
        current_fork: &str,
        boundary: &EpochBoundary,
        store: &mut S,
    ) -> Result<Option<&ForkConfig<R>>, ForksError>
    where
        S: ForksEpochStore + ?Sized,
    {
        if self.by_name(current_fork).is_none() {
            return Err(ForkConsistencyError::UnknownFork(current_fork.to_string()).into());
        }

        let next_epoch = boundary.epoch.next();
        let enacted = match self.next_fork_link(current_fork) {
            Some(NextForkLink::Fixed(index)) => {
                let config = &self.fixed[index];
                let reached = config
                    .fixed_epoch()
                    .is_some_and(|epoch| next_epoch >= epoch);
                (boundary.ends_epoch && reached).then_some(config)
            }
            Some(NextForkLink::Candidate) => {
                if self.should_candidate_fork_be_enacted(boundary, &*store)? {
                    self.candidate_fork()
                } else {
                    None
                }
            }
            None => None,
        };

        if boundary.ends_epoch && !boundary.voting_results.is_empty() {
            store.store_fork_voting_results(&boundary.voting_results)?;
        }

        if let Some(config) = enacted {
            info!(fork = config.name(), epoch = %next_epoch, "fork enacted");
            store.store_fork_at_epoch(next_epoch, config.name())?;
        }

        Ok(enacted)
    }
}

impl<R> Debug for Forks<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forks")
            .field("fixed", &self.fixed)
            .field("candidate", &self.candidate)
            .field("links", &self.links)
            .finish()
    }
}
