//! Durable fork activation history.
//!
//! The registry records which fork became active at which epoch and the
//! per-epoch candidate voting results. Both must survive restarts; on
//! startup the registry reconciles this history with its configuration.

use std::collections::BTreeMap;

use tessera_types::Epoch;

use crate::config::CandidateForkId;
use crate::error::StoreError;
use crate::voting::ForkVotingResult;

pub trait ForksEpochStore {
    /// Every recorded activation, keyed by epoch.
    fn stored_forks(&self) -> Result<BTreeMap<Epoch, String>, StoreError>;

    fn store_fork_at_epoch(&mut self, epoch: Epoch, name: &str) -> Result<(), StoreError>;

    fn store_fork_voting_results(&mut self, results: &[ForkVotingResult])
    -> Result<(), StoreError>;

    /// Voting results for `candidate` with `from <= epoch < to`, ordered by
    /// epoch.
    fn fork_voting_results<'a>(
        &'a self,
        from: Epoch,
        to: Epoch,
        candidate: &CandidateForkId,
    ) -> Result<Box<dyn Iterator<Item = ForkVotingResult> + 'a>, StoreError>;
}

/// Reports how far the ledger has been committed.
pub trait CommittedReader {
    fn last_committed_epoch(&self) -> Option<Epoch>;
}

impl CommittedReader for Option<Epoch> {
    fn last_committed_epoch(&self) -> Option<Epoch> {
        *self
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct InMemoryForksEpochStore {
    forks: BTreeMap<Epoch, String>,
    votes: BTreeMap<(CandidateForkId, Epoch), ForkVotingResult>,
}

impl InMemoryForksEpochStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ForksEpochStore for InMemoryForksEpochStore {
    fn stored_forks(&self) -> Result<BTreeMap<Epoch, String>, StoreError> {
        Ok(self.forks.clone())
    }

    fn store_fork_at_epoch(&mut self, epoch: Epoch, name: &str) -> Result<(), StoreError> {
        if let Some(existing) = self.forks.get(&epoch)
            && existing != name
        {
            return Err(StoreError(format!(
                "epoch {epoch} already activated fork '{existing}'"
            )));
        }
        self.forks.insert(epoch, name.to_string());
        Ok(())
    }

    fn store_fork_voting_results(
        &mut self,
        results: &[ForkVotingResult],
    ) -> Result<(), StoreError> {
        for result in results {
            self.votes
                .insert((result.candidate_fork_id, result.epoch), *result);
        }
        Ok(())
    }

    fn fork_voting_results<'a>(
        &'a self,
        from: Epoch,
        to: Epoch,
        candidate: &CandidateForkId,
    ) -> Result<Box<dyn Iterator<Item = ForkVotingResult> + 'a>, StoreError> {
        if from >= to {
            return Ok(Box::new(std::iter::empty()));
        }
        let range = self
            .votes
            .range((*candidate, from)..(*candidate, to))
            .map(|(_, result)| *result);
        Ok(Box::new(range))
    }
}
