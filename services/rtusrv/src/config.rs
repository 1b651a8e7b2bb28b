//! rtusrv configuration
//!
//! Loaded from a YAML file, then overridden by `RTUSRV_*` environment
//! variables (`RTUSRV_LOG_LEVEL=debug` sets `log.level`).

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use voltage_rtu::{HubConfig, RtuConfig};

use crate::error::{Result, RtuSrvError};

pub const DEFAULT_CONFIG_PATH: &str = "config/rtusrv.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub hubs: Vec<HubConfig>,
}

impl ServiceConfig {
    /// Load from `path` plus environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RtuSrvError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: ServiceConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("RTUSRV_").split("_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = Figment::new().merge(Yaml::string(yaml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Accept the file when at least one hub definition is usable
    ///
    /// Individual bad definitions are reported when the service starts.
    pub fn validate(&self) -> Result<()> {
        if self.hubs.is_empty() {
            return Err(RtuSrvError::config("At least one hub must be configured"));
        }
        let rtu = self.rtu();
        if !rtu.has_usable_hub() {
            let reasons: Vec<String> = rtu
                .rejected()
                .into_iter()
                .map(|(_, err)| err.to_string())
                .collect();
            return Err(RtuSrvError::config(format!(
                "No usable hub definition: {}",
                reasons.join("; ")
            )));
        }
        Ok(())
    }

    pub fn rtu(&self) -> RtuConfig {
        RtuConfig {
            hubs: self.hubs.clone(),
        }
    }
}
