//! YAML description of a fleet, as consumed by `fleetctl`.

use crate::{controller, genesis, monitor, node};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, time::Duration};
use thiserror::Error;

/// Errors that can occur when loading a [Config].
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node image settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    pub name: String,
    #[serde(default)]
    pub faulty: Option<String>,
}

/// Inactivity windows of the liveness monitor (seconds).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub first_block_grace: u64,
    pub steady_grace: u64,
    pub warmup: u64,

    /// How long `smoke` watches the fleet.
    pub duration: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            first_block_grace: 10,
            steady_grace: 3,
            warmup: 3,
            duration: 60,
        }
    }
}

/// Fleet description.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub image: ImageConfig,
    pub fullnodes: usize,
    #[serde(default)]
    pub faulty: usize,
    #[serde(default = "default_fault_mode")]
    pub fault_mode: u64,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Wire a full mesh instead of a ring.
    #[serde(default = "default_strong")]
    pub strong: bool,

    /// Scratch directory for genesis and node data (defaults to the system temp dir).
    #[serde(default)]
    pub workdir: Option<String>,

    /// Pair every fullnode with a vault.
    #[serde(default)]
    pub vaults: bool,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Arguments appended to every node command line.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Keystore files per fullnode, unlocked at start.
    #[serde(default)]
    pub keystores: Vec<Vec<String>>,

    /// Password of the keystores.
    #[serde(default)]
    pub password: String,
}

fn default_fault_mode() -> u64 {
    1
}

fn default_chain_id() -> u64 {
    2017
}

fn default_strong() -> bool {
    true
}

impl Config {
    /// Load a config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from YAML text.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.fullnodes == 0 {
            return Err(Error::Invalid("fullnodes must be positive".into()));
        }
        if self.image.name.is_empty() {
            return Err(Error::Invalid("image name is empty".into()));
        }
        if self.monitor.first_block_grace == 0 || self.monitor.steady_grace == 0 {
            return Err(Error::Invalid("monitor grace windows must be positive".into()));
        }
        let total = self.fullnodes + self.faulty;
        if !self.keystores.is_empty() && self.keystores.len() < total {
            return Err(Error::Invalid(format!(
                "keystores for {} of {total} fullnodes",
                self.keystores.len()
            )));
        }
        Ok(())
    }

    /// Liveness monitor settings.
    pub fn monitor(&self) -> monitor::Config {
        monitor::Config {
            first_block_grace: Duration::from_secs(self.monitor.first_block_grace),
            steady_grace: Duration::from_secs(self.monitor.steady_grace),
            warmup: self.monitor.warmup,
        }
    }

    /// Fleet settings for nodes attached to `network`.
    pub fn fleet(&self, network: Option<String>) -> controller::Config {
        let defaults = controller::Config::default();
        controller::Config {
            node: node::Config {
                image: self.image.name.clone(),
                network_id: self.chain_id,
                extra_args: self.extra_args.clone(),
                password: self.password.clone(),
                ..node::Config::default()
            },
            fullnodes: self.fullnodes,
            faulty: self.faulty,
            faulty_image: self.image.faulty.clone().unwrap_or(defaults.faulty_image),
            fault_mode: self.fault_mode,
            genesis: genesis::Config {
                chain_id: self.chain_id,
                ..genesis::Config::default()
            },
            workdir: self.workdir.clone().map(Into::into).unwrap_or(defaults.workdir),
            network,
            monitor: self.monitor(),
            keystores: self
                .keystores
                .iter()
                .map(|paths| paths.iter().map(Into::into).collect())
                .collect(),
            ..defaults
        }
    }
}
