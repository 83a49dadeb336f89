//! Fork registry errors.
//!
//! Configuration errors are raised once, when the registry is built, and are
//! fatal at startup. Consistency errors mean the activation store disagrees
//! with the configured schedule; a node hitting one must stop processing.

use tessera_types::Epoch;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ForkConfigError {
    #[error("duplicate fork name '{0}'")]
    DuplicateName(String),

    #[error("at least one fixed-epoch fork is required")]
    NoFixedFork,

    #[error("genesis fork '{name}' must start at epoch 0, got {epoch}")]
    GenesisNotAtZero { name: String, epoch: Epoch },

    #[error("fork '{name}' at epoch {epoch} does not follow the previous fork at epoch {previous}")]
    NonIncreasingEpochs {
        name: String,
        epoch: Epoch,
        previous: Epoch,
    },

    #[error("only a single candidate fork is allowed")]
    MultipleCandidates,

    #[error("candidate min epoch {min_epoch} must be greater than the last fixed epoch {last_fixed}")]
    CandidateOverlapsFixed { min_epoch: Epoch, last_fixed: Epoch },

    #[error("candidate window [{min_epoch}, {max_epoch}] is empty")]
    InvalidCandidateWindow { min_epoch: Epoch, max_epoch: Epoch },

    #[error("candidate fork '{0}' has no voting thresholds")]
    MissingThresholds(String),

    #[error("invalid threshold: {required_stake} basis points over {epochs} epochs")]
    InvalidThreshold { required_stake: u16, epochs: u64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ForkConsistencyError {
    #[error("fork '{name}' should have been executed at epoch {epoch}, but wasn't")]
    MissingFixedFork { name: String, epoch: Epoch },

    #[error("fork '{name}' recorded at epoch {epoch}, beyond the current epoch {current}")]
    StoredForkInFuture {
        name: String,
        epoch: Epoch,
        current: Epoch,
    },

    #[error("fork '{name}' was executed at epoch {epoch}, but shouldn't have been")]
    UnexpectedStoredFork { name: String, epoch: Epoch },

    #[error("candidate fork '{name}' should have been executed at epoch {computed}, but was at {stored}")]
    CandidateEpochMismatch {
        name: String,
        computed: Epoch,
        stored: Epoch,
    },

    #[error("candidate fork '{name}' shouldn't have been executed, but was at epoch {stored}")]
    CandidateWithoutVotes { name: String, stored: Epoch },

    #[error("unknown fork '{0}'")]
    UnknownFork(String),
}

/// Failure reported by an activation store implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("activation store: {0}")]
pub struct StoreError(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ForksError {
    #[error(transparent)]
    Config(#[from] ForkConfigError),

    #[error("forks inconsistency: {0}")]
    Consistency(#[from] ForkConsistencyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
