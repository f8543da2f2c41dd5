use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::generate_self_signed::SelfSignedCertBuilder;
use crate::host::FileHostConfig;

pub const DEFAULT_CONFIG_PATH: &str = "auto-ssl.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub certificate: CertificateSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostSettings {
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Relative to `data_directory` unless absolute
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    #[serde(default = "default_supports_live_reload")]
    pub supports_live_reload: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            settings_file: default_settings_file(),
            supports_live_reload: default_supports_live_reload(),
        }
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("auto-ssl.conf.toml")
}

fn default_supports_live_reload() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CertificateSettings {
    /// 0 keeps notAfter equal to notBefore
    #[serde(default)]
    pub validity_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from `path`, or defaults when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration with default path (auto-ssl.toml)
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn open_host(&self) -> Result<FileHostConfig> {
        FileHostConfig::open(
            &self.host.data_directory,
            &self.host.settings_file,
            self.host.supports_live_reload,
        )
        .context(format!(
            "Failed to open host configuration in {}",
            self.host.data_directory.display()
        ))
    }

    pub fn certificate_builder(&self) -> SelfSignedCertBuilder {
        SelfSignedCertBuilder::new().validity_days(self.certificate.validity_days)
    }
}
