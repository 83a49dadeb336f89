//! Node settings for Tessera: the fork schedule and engine limits.
//!
//! Sources merge lowest precedence first: built-in defaults, the user file
//! (`~/.config/tessera/config.toml`), `tessera.toml`, `tessera.local.toml`,
//! then `TESSERA_*` environment variables. See [`ConfigLoader`].

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tessera_engine::{ExecutionContext, FixedFeeMeter, Meter, NoopMeter, TxnSizeFeeMeter};
use tessera_forks::{CandidateSchedule, ForkConfig, Forks, Threshold};
use tessera_types::{Amount, Epoch, PermissionLevel, ResourceAddr, Txn};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub forks: ForksSettings,
    pub engine: EngineSettings,
}

// ============================================================================
// Fork Schedule
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForksSettings {
    pub fixed: Vec<FixedForkSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateSettings>,
}

impl Default for ForksSettings {
    fn default() -> Self {
        Self {
            fixed: vec![FixedForkSettings {
                name: "genesis".to_string(),
                epoch: 0,
            }],
            candidate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedForkSettings {
    pub name: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSettings {
    pub name: String,
    pub min_epoch: u64,
    pub max_epoch: u64,
    pub thresholds: Vec<ThresholdSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSettings {
    /// Basis points of total stake.
    pub required_stake: u16,
    pub epochs: u64,
}

impl ForksSettings {
    /// Turns the schedule into fork configs, resolving each fork name to the
    /// rule set it activates.
    pub fn to_fork_configs<R, F>(&self, mut resolve: F) -> Result<Vec<ForkConfig<R>>, ConfigError>
    where
        F: FnMut(&str) -> Option<R>,
    {
        let mut configs = Vec::with_capacity(self.fixed.len() + 1);

        for fork in &self.fixed {
            let rules = resolve(&fork.name)
                .ok_or_else(|| ConfigError::UnknownRuleSet(fork.name.clone()))?;
            configs.push(ForkConfig::fixed(&fork.name, Epoch::new(fork.epoch), rules));
        }

        if let Some(candidate) = &self.candidate {
            let rules = resolve(&candidate.name)
                .ok_or_else(|| ConfigError::UnknownRuleSet(candidate.name.clone()))?;
            let thresholds = candidate
                .thresholds
                .iter()
                .map(|t| Threshold::new(t.required_stake, t.epochs))
                .collect();
            let schedule = CandidateSchedule::new(
                Epoch::new(candidate.min_epoch),
                Epoch::new(candidate.max_epoch),
                thresholds,
            );
            configs.push(ForkConfig::candidate(&candidate.name, schedule, rules));
        }

        Ok(configs)
    }

    /// Builds the fork registry.
    pub fn build<R, F>(&self, resolve: F) -> Result<Forks<R>, ConfigError>
    where
        F: FnMut(&str) -> Option<R>,
    {
        Ok(Forks::create(self.to_fork_configs(resolve)?)?)
    }

    /// Checks the schedule without resolving rule sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build(|_| Some(())).map(|_| ())
    }
}

// ============================================================================
// Engine Limits
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_signatures_per_txn: u32,
    /// Flat fee per transaction, in subunits.
    pub fixed_fee: u64,
    /// Fee per payload byte, in subunits.
    pub fee_per_byte: u64,
    pub native_resource: Vec<u8>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_signatures_per_txn: 50,
            fixed_fee: 0,
            fee_per_byte: 0,
            native_resource: ResourceAddr::native().as_bytes().to_vec(),
        }
    }
}

impl EngineSettings {
    pub fn native_resource(&self) -> ResourceAddr {
        ResourceAddr::new(self.native_resource.clone())
    }

    /// A fresh execution context paying fees in the configured resource,
    /// with the configured signature budget.
    pub fn context(&self, txn: Txn, level: PermissionLevel) -> ExecutionContext {
        ExecutionContext::new(txn, level, self.max_signatures_per_txn)
            .with_fee_resource(self.native_resource())
    }

    /// The fee meter for these settings.
    pub fn meter(&self) -> Box<dyn Meter> {
        if self.fixed_fee > 0 {
            Box::new(FixedFeeMeter::new(Amount::from(self.fixed_fee)))
        } else if self.fee_per_byte > 0 {
            Box::new(TxnSizeFeeMeter::new(Amount::from(self.fee_per_byte)))
        } else {
            Box::new(NoopMeter)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fixed_fee > 0 && self.fee_per_byte > 0 {
            return Err(ConfigError::InvalidEngine(
                "fixed_fee and fee_per_byte are mutually exclusive".to_string(),
            ));
        }
        if self.native_resource.is_empty() {
            return Err(ConfigError::InvalidEngine(
                "native_resource must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl TesseraConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.forks.validate()?;
        self.engine.validate()
    }
}
