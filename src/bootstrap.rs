//! Automatic SSL bootstrap for a node.
//!
//! When a node is set up without SSL while its outbound connections require
//! it, the rest of the cluster is assumed to expect encrypted connections.
//! The bootstrap then turns SSL on for the host and, when no certificate is
//! installed yet, generates a self-signed key and certificate pair.
//!
//! # State machine
//! ```text
//! Idle ─► PolicyCheck ─► HostEnable ─► ExistenceCheck ─► Generate ─► Persist ─► Reload ─► Done
//!  │           │                             │               │           │
//!  └─► Done    └─► Done                      └─► Done        └─► Failed  └─► Failed
//! ```
//!
//! Runs are synchronous. The credential lock held from `ExistenceCheck` to
//! `Persist` keeps concurrent bootstraps on the same paths from interleaving.
//! It is taken on the directory holding the certificate, so the check creates
//! no files.

use std::fmt;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{debug, error, info, warn};

use crate::credential_store::{CertificateCheck, CredentialStore};
use crate::error::{BootstrapError, CryptoError, HostError};
use crate::generate_keypair::generate_keypair;
use crate::generate_self_signed::{certificate_summary, SelfSignedCertBuilder};
use crate::host::{HostConfig, ReloadOutcome, NODE_CONNINFO_SETTING};
use crate::policy::should_auto_enable;

/// Connection string restored by [`reset_default_for_node_conninfo`].
pub const LEGACY_NODE_CONNINFO: &str = "sslmode=prefer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    PolicyCheck,
    HostEnable,
    ExistenceCheck,
    Generate,
    Persist,
    Reload,
    Done,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::Idle => "idle",
            BootstrapState::PolicyCheck => "policy-check",
            BootstrapState::HostEnable => "host-enable",
            BootstrapState::ExistenceCheck => "existence-check",
            BootstrapState::Generate => "generate",
            BootstrapState::Persist => "persist",
            BootstrapState::Reload => "reload",
            BootstrapState::Done => "done",
            BootstrapState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a successful bootstrap ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// SSL was already on; nothing was done.
    AlreadyEnabled,
    /// The outbound policy does not require SSL; nothing was done.
    PolicyDeclined,
    /// SSL was turned on; a certificate was already installed.
    CredentialsPresent,
    /// SSL was turned on; no SSL context was available to look for an
    /// installed certificate, so none was generated.
    CertificateCheckUnavailable,
    /// SSL was turned on and a new key and certificate were written.
    Generated { reload: ReloadOutcome },
}

/// Source of a fresh private key and matching certificate.
pub trait KeyMaterialSource {
    fn generate(&mut self) -> Result<(PKey<Private>, X509), CryptoError>;
}

/// RSA-2048 key with a self-signed `CN=citus-auto-ssl` certificate.
#[derive(Debug, Clone, Default)]
pub struct RsaSelfSigned {
    builder: SelfSignedCertBuilder,
}

impl RsaSelfSigned {
    pub fn new(builder: SelfSignedCertBuilder) -> Self {
        Self { builder }
    }
}

impl KeyMaterialSource for RsaSelfSigned {
    fn generate(&mut self) -> Result<(PKey<Private>, X509), CryptoError> {
        let private_key = generate_keypair()?;
        let certificate = self.builder.build(&private_key)?;
        Ok((private_key, certificate))
    }
}

/// One bootstrap run against a host.
pub struct Bootstrap<'a, H: HostConfig, M: KeyMaterialSource = RsaSelfSigned> {
    host: &'a mut H,
    material: M,
    state: BootstrapState,
}

impl<'a, H: HostConfig> Bootstrap<'a, H, RsaSelfSigned> {
    pub fn new(host: &'a mut H) -> Self {
        Self::with_material_source(host, RsaSelfSigned::default())
    }
}

impl<'a, H: HostConfig, M: KeyMaterialSource> Bootstrap<'a, H, M> {
    pub fn with_material_source(host: &'a mut H, material: M) -> Self {
        Self {
            host,
            material,
            state: BootstrapState::Idle,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the bootstrap to a terminal state.
    ///
    /// # Errors
    /// Any crypto, storage or host error moves the run to
    /// [`BootstrapState::Failed`] and is returned unchanged. Files written
    /// before the failure are left in place.
    pub fn run(&mut self) -> Result<BootstrapOutcome, BootstrapError> {
        match self.advance() {
            Ok(outcome) => {
                self.transition(BootstrapState::Done);
                Ok(outcome)
            }
            Err(e) => {
                error!(state = %self.state, "ssl bootstrap failed: {}", e);
                self.transition(BootstrapState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: BootstrapState) {
        debug!(from = %self.state, to = %next, "ssl bootstrap transition");
        self.state = next;
    }

    fn advance(&mut self) -> Result<BootstrapOutcome, BootstrapError> {
        if self.host.is_encryption_enabled() {
            debug!("ssl already enabled, nothing to do");
            return Ok(BootstrapOutcome::AlreadyEnabled);
        }

        self.transition(BootstrapState::PolicyCheck);
        let policy = self.host.outbound_connection_policy();
        if !should_auto_enable(&policy) {
            debug!(
                sslmode = policy.effective_sslmode(),
                "outbound connections do not require ssl, leaving it off"
            );
            return Ok(BootstrapOutcome::PolicyDeclined);
        }

        self.transition(BootstrapState::HostEnable);
        info!("node set up without ssl enabled, turning it on");
        self.host.enable_encryption()?;

        self.transition(BootstrapState::ExistenceCheck);
        let store = CredentialStore::new(self.host.credential_paths());
        let lock = store.lock()?;
        match store.check() {
            CertificateCheck::Present => {
                info!(
                    certificate = %store.files().certificate_path.display(),
                    "certificate already present, not generating new credentials"
                );
                return Ok(BootstrapOutcome::CredentialsPresent);
            }
            CertificateCheck::Unavailable => {
                warn!("cannot check for an installed certificate, not generating new credentials");
                return Ok(BootstrapOutcome::CertificateCheckUnavailable);
            }
            CertificateCheck::Absent => {}
        }

        self.transition(BootstrapState::Generate);
        info!("no certificate present, generating self signed certificate");
        let (private_key, certificate) = self.material.generate()?;
        match certificate_summary(&certificate) {
            Ok(summary) => info!("generated {}", summary),
            Err(e) => debug!("unable to summarize certificate: {}", e),
        }

        self.transition(BootstrapState::Persist);
        store.persist(&private_key, &certificate)?;
        drop(lock);

        self.transition(BootstrapState::Reload);
        let reload = self.host.reload_live_configuration()?;
        if reload == ReloadOutcome::RestartRequired {
            warn_restart_required();
        }

        Ok(BootstrapOutcome::Generated { reload })
    }
}

fn warn_restart_required() {
    warn!(
        "restart required: ssl settings were written but this server cannot \
         reload them live; restart it for the change to take effect, or turn \
         ssl off and lower sslmode in {} below require",
        NODE_CONNINFO_SETTING
    );
}

/// Pin the outbound connection string back to `sslmode=prefer`.
///
/// Used on upgrade when the new default of requiring SSL conflicts with a
/// cluster that runs without it.
pub fn reset_default_for_node_conninfo<H: HostConfig>(
    host: &mut H,
) -> Result<ReloadOutcome, HostError> {
    info!(
        "reset {} to old default value as the new value is incompatible with the current ssl setting",
        NODE_CONNINFO_SETTING
    );
    host.apply_config_override(NODE_CONNINFO_SETTING, LEGACY_NODE_CONNINFO)?;

    let reload = host.reload_live_configuration()?;
    if reload == ReloadOutcome::RestartRequired {
        warn_restart_required();
    }
    Ok(reload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::CredentialFiles;
    use crate::error::{FileKind, StorageError};
    use crate::generate_self_signed::AUTO_SSL_COMMON_NAME;
    use crate::host::FileHostConfig;
    use crate::policy::ConnectionPolicy;
    use openssl::nid::Nid;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory host recording every mutation.
    struct FakeHost {
        live_ssl: bool,
        persisted_ssl: bool,
        conninfo: String,
        files: CredentialFiles,
        supports_live_reload: bool,
        overrides: Vec<(String, String)>,
        reloads: usize,
    }

    impl FakeHost {
        fn new(dir: &Path, conninfo: &str) -> Self {
            Self {
                live_ssl: false,
                persisted_ssl: false,
                conninfo: conninfo.to_string(),
                files: CredentialFiles {
                    private_key_path: dir.join("server.key"),
                    certificate_path: dir.join("server.crt"),
                },
                supports_live_reload: true,
                overrides: Vec::new(),
                reloads: 0,
            }
        }
    }

    impl HostConfig for FakeHost {
        fn is_encryption_enabled(&self) -> bool {
            self.live_ssl
        }

        fn enable_encryption(&mut self) -> Result<(), HostError> {
            self.persisted_ssl = true;
            Ok(())
        }

        fn apply_config_override(&mut self, name: &str, value: &str) -> Result<(), HostError> {
            self.overrides.push((name.to_string(), value.to_string()));
            Ok(())
        }

        fn reload_live_configuration(&mut self) -> Result<ReloadOutcome, HostError> {
            self.reloads += 1;
            if !self.supports_live_reload {
                return Ok(ReloadOutcome::RestartRequired);
            }
            self.live_ssl = self.persisted_ssl;
            Ok(ReloadOutcome::Reloaded)
        }

        fn outbound_connection_policy(&self) -> ConnectionPolicy {
            ConnectionPolicy::parse(&self.conninfo)
        }

        fn credential_paths(&self) -> CredentialFiles {
            self.files.clone()
        }
    }

    /// Real key material, counting how often it is asked for.
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        inner: RsaSelfSigned,
    }

    impl CountingSource {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Self {
                calls: Arc::clone(&calls),
                inner: RsaSelfSigned::default(),
            };
            (source, calls)
        }
    }

    impl KeyMaterialSource for CountingSource {
        fn generate(&mut self) -> Result<(PKey<Private>, X509), CryptoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate()
        }
    }

    fn dir_listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn read_files(files: &CredentialFiles) -> (Vec<u8>, Vec<u8>) {
        (
            fs::read(&files.private_key_path).unwrap(),
            fs::read(&files.certificate_path).unwrap(),
        )
    }

    #[test]
    fn test_prefer_policy_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=prefer");
        let (source, calls) = CountingSource::new();

        let mut bootstrap = Bootstrap::with_material_source(&mut host, source);
        let outcome = bootstrap.run().unwrap();
        assert_eq!(outcome, BootstrapOutcome::PolicyDeclined);
        assert_eq!(bootstrap.state(), BootstrapState::Done);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!host.persisted_ssl);
        assert!(!host.live_ssl);
        assert_eq!(host.reloads, 0);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_sslmode_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "connect_timeout=30");

        let outcome = Bootstrap::new(&mut host).run().unwrap();
        assert_eq!(outcome, BootstrapOutcome::PolicyDeclined);
        assert!(!host.persisted_ssl);
    }

    #[test]
    fn test_already_enabled_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");
        host.live_ssl = true;
        let (source, calls) = CountingSource::new();

        let outcome = Bootstrap::with_material_source(&mut host, source)
            .run()
            .unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyEnabled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!host.persisted_ssl);
        assert!(!host.files.certificate_path.exists());
    }

    #[test]
    fn test_require_generates_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");

        let mut bootstrap = Bootstrap::new(&mut host);
        let outcome = bootstrap.run().unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::Generated {
                reload: ReloadOutcome::Reloaded
            }
        );
        assert_eq!(bootstrap.state(), BootstrapState::Done);

        assert!(host.persisted_ssl);
        assert!(host.live_ssl);
        assert_eq!(host.reloads, 1);

        let store = CredentialStore::new(host.files.clone());
        assert!(store.exists());

        let (key_pem, cert_pem) = read_files(&host.files);
        let key = PKey::private_key_from_pem(&key_pem).unwrap();
        let cert = X509::from_pem(&cert_pem).unwrap();
        assert_eq!(key.bits(), 2048);
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert!(cert.verify(&key).unwrap());
        let cn = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .to_string()
            .unwrap();
        assert_eq!(cn, AUTO_SSL_COMMON_NAME);
    }

    #[test]
    fn test_second_run_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");

        Bootstrap::new(&mut host).run().unwrap();
        let first = read_files(&host.files);

        let (source, calls) = CountingSource::new();
        let outcome = Bootstrap::with_material_source(&mut host, source)
            .run()
            .unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyEnabled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(read_files(&host.files), first);
    }

    #[test]
    fn test_existing_certificate_skips_generation() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");
        Bootstrap::new(&mut host).run().unwrap();
        let first = read_files(&host.files);

        // ssl switched off again by hand, certificate left behind, key gone
        host.live_ssl = false;
        host.persisted_ssl = false;
        fs::remove_file(&host.files.private_key_path).unwrap();

        let (source, calls) = CountingSource::new();
        let outcome = Bootstrap::with_material_source(&mut host, source)
            .run()
            .unwrap();
        assert_eq!(outcome, BootstrapOutcome::CredentialsPresent);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(host.persisted_ssl);
        assert!(!host.files.private_key_path.exists());
        assert_eq!(fs::read(&host.files.certificate_path).unwrap(), first.1);
    }

    #[test]
    fn test_restart_required_still_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");
        host.supports_live_reload = false;

        let outcome = Bootstrap::new(&mut host).run().unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::Generated {
                reload: ReloadOutcome::RestartRequired
            }
        );
        assert!(host.persisted_ssl);
        assert!(!host.live_ssl);
        assert!(CredentialStore::new(host.files.clone()).exists());
    }

    #[test]
    fn test_certificate_write_failure_leaves_key() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");
        // a directory where the certificate should go cannot be opened for writing
        host.files.certificate_path = temp_dir.path().join("server.crt.d");
        fs::create_dir(&host.files.certificate_path).unwrap();

        let mut bootstrap = Bootstrap::new(&mut host);
        let err = bootstrap.run().unwrap_err();
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(matches!(
            err,
            BootstrapError::Storage(StorageError::Open {
                kind: FileKind::Certificate,
                ..
            })
        ));

        assert!(host.files.private_key_path.is_file());
        assert!(!host.files.certificate_path.is_file());
        assert_eq!(host.reloads, 0);
        assert!(!host.live_ssl);
    }

    #[test]
    fn test_missing_certificate_directory_leaves_key() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("auto.toml"),
            "ssl_cert_file = \"certs/server.crt\"\n",
        )
        .unwrap();
        let mut host = FileHostConfig::open(temp_dir.path(), "auto.toml", true).unwrap();

        let mut bootstrap = Bootstrap::new(&mut host);
        let err = bootstrap.run().unwrap_err();
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(matches!(
            err,
            BootstrapError::Storage(StorageError::Open {
                kind: FileKind::Certificate,
                ..
            })
        ));

        let paths = host.credential_paths();
        assert_eq!(paths.private_key_path, temp_dir.path().join("server.key"));
        assert!(paths.private_key_path.is_file());
        assert!(!paths.certificate_path.exists());
        assert!(!temp_dir.path().join("certs").exists());
        assert!(!host.is_encryption_enabled());
    }

    #[test]
    fn test_present_certificate_leaves_directory_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");
        let (key, cert) = RsaSelfSigned::default().generate().unwrap();
        CredentialStore::new(host.files.clone())
            .persist(&key, &cert)
            .unwrap();
        let before = dir_listing(temp_dir.path());

        let outcome = Bootstrap::new(&mut host).run().unwrap();
        assert_eq!(outcome, BootstrapOutcome::CredentialsPresent);
        assert_eq!(dir_listing(temp_dir.path()), before);
    }

    #[test]
    fn test_waits_for_credential_lock() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let store = CredentialStore::new(FakeHost::new(&dir, "sslmode=require").files);
        let lock = store.lock().unwrap();

        let (source, calls) = CountingSource::new();
        let worker = thread::spawn(move || {
            let mut host = FakeHost::new(&dir, "sslmode=require");
            Bootstrap::with_material_source(&mut host, source).run()
        });

        // the other run blocks on the lock while credentials are installed here
        thread::sleep(Duration::from_millis(200));
        let (key, cert) = RsaSelfSigned::default().generate().unwrap();
        store.persist(&key, &cert).unwrap();
        let installed = read_files(store.files());
        drop(lock);

        let outcome = worker.join().unwrap().unwrap();
        assert_eq!(outcome, BootstrapOutcome::CredentialsPresent);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(read_files(store.files()), installed);
    }

    struct FailingSource;

    impl KeyMaterialSource for FailingSource {
        fn generate(&mut self) -> Result<(PKey<Private>, X509), CryptoError> {
            Err(CryptoError::KeyGeneration(openssl::error::ErrorStack::get()))
        }
    }

    #[test]
    fn test_crypto_failure_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");

        let mut bootstrap = Bootstrap::with_material_source(&mut host, FailingSource);
        let err = bootstrap.run().unwrap_err();
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(matches!(
            err,
            BootstrapError::Crypto(CryptoError::KeyGeneration(_))
        ));
        assert!(!host.files.private_key_path.exists());
        assert!(!host.files.certificate_path.exists());
        assert_eq!(host.reloads, 0);
    }

    #[test]
    fn test_reset_conninfo() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FakeHost::new(temp_dir.path(), "sslmode=require");

        let reload = reset_default_for_node_conninfo(&mut host).unwrap();
        assert_eq!(reload, ReloadOutcome::Reloaded);
        assert_eq!(
            host.overrides,
            vec![(
                NODE_CONNINFO_SETTING.to_string(),
                LEGACY_NODE_CONNINFO.to_string()
            )]
        );
        assert_eq!(host.reloads, 1);
    }

    #[test]
    fn test_file_host_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let mut host = FileHostConfig::open(temp_dir.path(), "auto.toml", true).unwrap();

        let outcome = Bootstrap::new(&mut host).run().unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::Generated {
                reload: ReloadOutcome::Reloaded
            }
        );
        assert!(host.is_encryption_enabled());
        assert!(CredentialStore::new(host.credential_paths()).exists());

        reset_default_for_node_conninfo(&mut host).unwrap();
        assert_eq!(host.outbound_connection_policy().sslmode(), Some("prefer"));
    }
}
