//! Key and certificate files on durable storage.
//!
//! The store never decides where credentials live; the paths come from the
//! host configuration. A loadable certificate is all it takes for the
//! credentials to count as present. The matching key is not inspected.
//!
//! Mutual exclusion between bootstraps is an advisory lock on a directory
//! handle, so checking and locking leave the credential directory untouched.
//!
//! Persisting writes the key first and the certificate second. The two
//! writes are not atomic: when the certificate write fails the key stays on
//! disk without a certificate, and nothing is rolled back.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod};
use openssl::x509::X509;
use tracing::{debug, info, warn};

use crate::error::{FileKind, StorageError};
use crate::secure_key::SecureKeyPem;

#[cfg(unix)]
const PRIVATE_KEY_MODE: u32 = 0o600;

/// Paths of the private key and certificate, as configured on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFiles {
    pub private_key_path: PathBuf,
    pub certificate_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    files: CredentialFiles,
}

impl CredentialStore {
    pub fn new(files: CredentialFiles) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &CredentialFiles {
        &self.files
    }

    /// Check whether a certificate chain can be loaded from the certificate path.
    ///
    /// The file is loaded through an OpenSSL context the same way the
    /// server's TLS layer loads it. Only well-formedness counts; trust and
    /// expiry are not checked. A context that cannot be created reports
    /// [`CertificateCheck::Unavailable`].
    pub fn check(&self) -> CertificateCheck {
        check_certificate(
            SslContext::builder(SslMethod::tls()),
            &self.files.certificate_path,
        )
    }

    /// True only when a certificate chain was loaded.
    pub fn exists(&self) -> bool {
        self.check() == CertificateCheck::Present
    }

    /// Write the private key and then the certificate as PEM.
    ///
    /// Existing files are truncated. On Unix the key file is restricted to
    /// mode `0600`.
    ///
    /// # Errors
    /// Returns [`StorageError::Open`] or [`StorageError::Write`] for the first
    /// file that fails. A key failure aborts before the certificate path is
    /// touched; a certificate failure leaves the written key in place.
    pub fn persist(
        &self,
        private_key: &PKey<Private>,
        certificate: &X509,
    ) -> Result<(), StorageError> {
        let key_path = &self.files.private_key_path;
        let cert_path = &self.files.certificate_path;

        let key_pem = SecureKeyPem::from_private_key(private_key).map_err(|e| {
            StorageError::Write {
                kind: FileKind::PrivateKey,
                path: key_path.clone(),
                source: io::Error::other(e),
            }
        })?;
        write_credential_file(key_path, FileKind::PrivateKey, key_pem.expose_pem())?;
        drop(key_pem);

        let cert_pem = certificate.to_pem().map_err(|e| StorageError::Write {
            kind: FileKind::Certificate,
            path: cert_path.clone(),
            source: io::Error::other(e),
        })?;
        write_credential_file(cert_path, FileKind::Certificate, &cert_pem)?;

        info!(
            key = %key_path.display(),
            certificate = %cert_path.display(),
            "stored private key and certificate"
        );
        Ok(())
    }

    /// Directory the credential lock is taken on.
    ///
    /// This is the closest existing ancestor directory of the certificate
    /// path, so locking never creates files and works before the
    /// certificate's own directory exists.
    pub fn lock_target(&self) -> PathBuf {
        self.files
            .certificate_path
            .ancestors()
            .skip(1)
            .find(|dir| dir.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Take an exclusive advisory lock guarding the credential files.
    ///
    /// Held until the returned guard is dropped. Concurrent bootstraps on the
    /// same paths serialize on it.
    pub fn lock(&self) -> Result<CredentialLock, StorageError> {
        let path = self.lock_target();
        let lock_error = |source: io::Error| StorageError::Lock {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).map_err(lock_error)?;
        FileExt::lock_exclusive(&file).map_err(lock_error)?;
        debug!(path = %path.display(), "acquired credential lock");
        Ok(CredentialLock { file, path })
    }
}

/// Result of looking for an installed certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateCheck {
    /// A certificate chain was loaded from the certificate path.
    Present,
    /// Nothing loadable at the certificate path.
    Absent,
    /// No SSL context to load the certificate with; presence is unknown.
    Unavailable,
}

fn check_certificate(
    context: Result<SslContextBuilder, ErrorStack>,
    certificate_path: &Path,
) -> CertificateCheck {
    let mut context = match context {
        Ok(context) => context,
        Err(e) => {
            warn!("unable to create SSL context to check certificate: {}", e);
            return CertificateCheck::Unavailable;
        }
    };

    match context.set_certificate_chain_file(certificate_path) {
        Ok(()) => CertificateCheck::Present,
        Err(e) => {
            debug!(
                path = %certificate_path.display(),
                "no loadable certificate: {}", e
            );
            CertificateCheck::Absent
        }
    }
}

/// Guard returned by [`CredentialStore::lock`].
#[derive(Debug)]
pub struct CredentialLock {
    file: File,
    path: PathBuf,
}

impl CredentialLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CredentialLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "failed to release credential lock: {}", e);
        }
    }
}

fn write_credential_file(path: &Path, kind: FileKind, contents: &[u8]) -> Result<(), StorageError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if kind == FileKind::PrivateKey {
            options.mode(PRIVATE_KEY_MODE);
        }
    }

    let mut file = options.open(path).map_err(|source| StorageError::Open {
        kind,
        path: path.to_path_buf(),
        source,
    })?;

    let written = restrict_permissions(&file, kind)
        .and_then(|()| file.write_all(contents))
        .and_then(|()| file.sync_all());
    written.map_err(|source| StorageError::Write {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

// the mode passed at open time does not apply to a file that already existed
#[cfg(unix)]
fn restrict_permissions(file: &File, kind: FileKind) -> io::Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    if kind == FileKind::PrivateKey {
        file.set_permissions(Permissions::from_mode(PRIVATE_KEY_MODE))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File, _kind: FileKind) -> io::Result<()> {
    Ok(())
}
