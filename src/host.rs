//! Host configuration collaborator.
//!
//! The bootstrap never touches server settings directly. It talks to a
//! [`HostConfig`], which distinguishes between *persisted* settings (what a
//! restart or reload would pick up) and *live* settings (what the running
//! process currently uses).
//!
//! [`FileHostConfig`] keeps the persisted settings in a TOML file inside the
//! data directory and the live settings in memory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use toml::{Table, Value};
use tracing::{debug, info};

use crate::credential_store::CredentialFiles;
use crate::error::HostError;
use crate::policy::ConnectionPolicy;

/// Setting that turns transport encryption on.
pub const SSL_SETTING: &str = "ssl";
/// Outbound connection string used towards other nodes.
pub const NODE_CONNINFO_SETTING: &str = "citus.node_conninfo";
pub const SSL_KEY_FILE_SETTING: &str = "ssl_key_file";
pub const SSL_CERT_FILE_SETTING: &str = "ssl_cert_file";

pub const DEFAULT_NODE_CONNINFO: &str = "sslmode=require";
pub const DEFAULT_SSL_KEY_FILE: &str = "server.key";
pub const DEFAULT_SSL_CERT_FILE: &str = "server.crt";

/// Result of asking the host to apply persisted settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The running process now uses the persisted settings.
    Reloaded,
    /// The host cannot reload live; the settings apply after a restart.
    RestartRequired,
}

/// Operations the bootstrap needs from the host configuration subsystem.
pub trait HostConfig {
    /// Whether encryption is on in the live configuration.
    fn is_encryption_enabled(&self) -> bool;

    /// Persist a configuration change turning transport encryption on.
    fn enable_encryption(&mut self) -> Result<(), HostError>;

    /// Persist `setting_name` pinned to `literal_value`.
    fn apply_config_override(
        &mut self,
        setting_name: &str,
        literal_value: &str,
    ) -> Result<(), HostError>;

    /// Make persisted changes visible to the running process, when supported.
    fn reload_live_configuration(&mut self) -> Result<ReloadOutcome, HostError>;

    fn outbound_connection_policy(&self) -> ConnectionPolicy;

    fn credential_paths(&self) -> CredentialFiles;
}

/// File-backed host configuration.
#[derive(Debug)]
pub struct FileHostConfig {
    data_directory: PathBuf,
    settings_path: PathBuf,
    supports_live_reload: bool,
    live: Table,
}

impl FileHostConfig {
    /// Open the host configuration and load its live settings.
    ///
    /// `settings_file` is resolved against `data_directory` when relative. A
    /// missing settings file means every setting has its default.
    pub fn open(
        data_directory: impl Into<PathBuf>,
        settings_file: impl AsRef<Path>,
        supports_live_reload: bool,
    ) -> Result<Self, HostError> {
        let data_directory = data_directory.into();
        let settings_path = data_directory.join(settings_file);
        let live = read_settings(&settings_path)?;
        debug!(path = %settings_path.display(), settings = live.len(), "loaded host settings");

        Ok(Self {
            data_directory,
            settings_path,
            supports_live_reload,
            live,
        })
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Live value of a setting, if set.
    pub fn setting(&self, name: &str) -> Option<&Value> {
        self.live.get(name)
    }

    /// Persisted value of a setting, read from disk.
    pub fn persisted_setting(&self, name: &str) -> Result<Option<Value>, HostError> {
        Ok(read_settings(&self.settings_path)?.remove(name))
    }

    fn live_str(&self, name: &str) -> Option<&str> {
        self.live.get(name).and_then(Value::as_str)
    }

    fn persist_setting(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        let mut persisted = read_settings(&self.settings_path)?;
        persisted.insert(name.to_string(), value);
        write_settings(&self.settings_path, &persisted)?;
        info!(setting = name, path = %self.settings_path.display(), "persisted setting");
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        // absolute paths replace the data directory in join
        self.data_directory.join(path)
    }
}

impl HostConfig for FileHostConfig {
    fn is_encryption_enabled(&self) -> bool {
        match self.live.get(SSL_SETTING) {
            Some(Value::Boolean(enabled)) => *enabled,
            Some(Value::String(value)) => parse_bool(value).unwrap_or(false),
            _ => false,
        }
    }

    fn enable_encryption(&mut self) -> Result<(), HostError> {
        self.persist_setting(SSL_SETTING, Value::Boolean(true))
    }

    fn apply_config_override(
        &mut self,
        setting_name: &str,
        literal_value: &str,
    ) -> Result<(), HostError> {
        if setting_name.is_empty() {
            return Err(HostError::InvalidSetting {
                name: setting_name.to_string(),
                value: literal_value.to_string(),
            });
        }
        self.persist_setting(setting_name, Value::String(literal_value.to_string()))
    }

    fn reload_live_configuration(&mut self) -> Result<ReloadOutcome, HostError> {
        if !self.supports_live_reload {
            return Ok(ReloadOutcome::RestartRequired);
        }
        self.live = read_settings(&self.settings_path)?;
        info!(path = %self.settings_path.display(), "reloaded host configuration");
        Ok(ReloadOutcome::Reloaded)
    }

    fn outbound_connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::parse(
            self.live_str(NODE_CONNINFO_SETTING)
                .unwrap_or(DEFAULT_NODE_CONNINFO),
        )
    }

    fn credential_paths(&self) -> CredentialFiles {
        CredentialFiles {
            private_key_path: self.resolve(
                self.live_str(SSL_KEY_FILE_SETTING)
                    .unwrap_or(DEFAULT_SSL_KEY_FILE),
            ),
            certificate_path: self.resolve(
                self.live_str(SSL_CERT_FILE_SETTING)
                    .unwrap_or(DEFAULT_SSL_CERT_FILE),
            ),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn read_settings(path: &Path) -> Result<Table, HostError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Table::new()),
        Err(source) => {
            return Err(HostError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    contents.parse::<Table>().map_err(|source| HostError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// Written to a temporary file first and renamed over the old one, so a
// reader never sees a half-written settings file.
fn write_settings(path: &Path, settings: &Table) -> Result<(), HostError> {
    let rendered = toml::to_string(settings)?;
    let write_error = |source: io::Error| HostError::Write {
        path: path.to_path_buf(),
        source,
    };

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(directory).map_err(write_error)?;
    temp.write_all(rendered.as_bytes()).map_err(write_error)?;
    temp.as_file().sync_all().map_err(write_error)?;
    temp.persist(path).map_err(|e| write_error(e.error))?;
    Ok(())
}
