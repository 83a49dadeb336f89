//! # tessera-forks: Rule-set versioning for `Tessera`
//!
//! A fork is a named set of ledger rules. This crate decides which fork is
//! active at each epoch and keeps a durable record of every activation.
//!
//! ## Key Principles
//!
//! - **Ordered**: forks activate one after another, never out of order
//! - **Epoch-aligned**: activations only happen on epoch boundaries
//! - **Reconciled**: on startup the recorded history must agree with the
//!   configured schedule, or the node refuses to run
//!
//! ## Architecture
//!
//! - [`config`]: fixed and candidate fork definitions
//! - [`voting`]: stake tallies and the consecutive-epoch threshold counter
//! - [`store`]: the activation store seam and an in-memory implementation
//! - [`registry`]: the [`Forks`] registry
//!
//! ## Example
//!
//! ```ignore
//! let forks = Forks::create(vec![
//!     ForkConfig::fixed("genesis", Epoch::ZERO, genesis_rules),
//!     ForkConfig::candidate("next", schedule, next_rules),
//! ])?;
//! forks.init(&last_committed_epoch, &mut store)?;
//!
//! if let Some(fork) = forks.process_epoch_boundary("genesis", &boundary, &mut store)? {
//!     // Switch to fork.rules() from the next epoch...
//! }
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod store;
pub mod voting;


pub use config::{
    CandidateForkId, CandidateSchedule, ForkConfig, ForkKind, MAX_STAKE, Threshold,
};
pub use error::{ForkConfigError, ForkConsistencyError, ForksError, StoreError};
pub use registry::{EpochBoundary, Forks, NextForkLink};
pub use store::{CommittedReader, ForksEpochStore, InMemoryForksEpochStore};
pub use voting::{
    ForkVotingResult, MIN_STORED_STAKE, ValidatorVote, any_threshold_passed,
    calculate_thresholds_passing_epochs, tally_fork_votes,
};
