//! rollgate.toml: orchestrator-level configuration.
//!
//! Every field is optional; a missing file means defaults. CLI flags
//! override values read from the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{serde_opt, serde_str};
use crate::error::{PlanError, PlanResult};

fn default_lease_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/rollgate")
}

fn default_port() -> u16 {
    8480
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// How long a lease survives without renewal.
    #[serde(with = "serde_str", default = "default_lease_ttl")]
    pub lease_ttl: Duration,
    /// Renewal period; defaults to a third of the TTL.
    #[serde(with = "serde_opt", default, skip_serializing_if = "Option::is_none")]
    pub renew_interval: Option<Duration>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on each signal query; defaults to the window's interval.
    #[serde(with = "serde_opt", default, skip_serializing_if = "Option::is_none")]
    pub query_timeout: Option<Duration>,
    /// Shell command per signal name, used by the command signal source.
    #[serde(default)]
    pub signals: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease_ttl(),
            renew_interval: None,
            data_dir: default_data_dir(),
            port: default_port(),
            query_timeout: None,
            signals: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> PlanResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> PlanResult<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
            .unwrap_or(self.lease_ttl / 3)
            .max(Duration::from_millis(100))
    }
}
