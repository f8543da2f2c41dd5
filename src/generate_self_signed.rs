//! Self-Signed Certificate Generation Module
//!
//! Builds the X.509 certificate that accompanies an automatically generated
//! node key. The certificate only exists so the server's TLS layer can start;
//! nothing in the cluster verifies it against a trust anchor.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same name
//! - **Subject**: `CN=citus-auto-ssl`
//! - **Serial Number**: constant `1`
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Validity**: `notBefore` is the build time; `notAfter` defaults to the
//!   same instant (a zero-length window) unless `validity_days` is set
//! - **Version**: OpenSSL default (v1), no extensions
//!
//! # Example
//! ```rust,no_run
//! use auto_ssl::generate_keypair::generate_keypair;
//! use auto_ssl::generate_self_signed::SelfSignedCertBuilder;
//! # fn example() -> Result<(), auto_ssl::error::CryptoError> {
//!
//! let key = generate_keypair()?;
//! let certificate = SelfSignedCertBuilder::new().build(&key)?;
//! # Ok(())
//! # }
//! ```

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509};

use crate::error::CryptoError;

/// Common name of every automatically generated certificate.
pub const AUTO_SSL_COMMON_NAME: &str = "citus-auto-ssl";

const CERTIFICATE_SERIAL: u32 = 1;

fn allocation(what: &'static str) -> impl FnOnce(ErrorStack) -> CryptoError {
    move |source| CryptoError::Allocation { what, source }
}

fn signing(step: &'static str) -> impl FnOnce(ErrorStack) -> CryptoError {
    move |source| CryptoError::Signing { step, source }
}

// ================= Self-Signed Certificate Builder =================

/// Builder for the self-signed certificate bound to a node key
///
/// The subject common name is fixed to [`AUTO_SSL_COMMON_NAME`]; the only
/// tunable is the validity window.
///
/// # Examples
/// ```rust,no_run
/// use auto_ssl::generate_self_signed::SelfSignedCertBuilder;
/// # use openssl::pkey::{PKey, Private};
/// # fn example(key: PKey<Private>) -> Result<(), auto_ssl::error::CryptoError> {
///
/// let certificate = SelfSignedCertBuilder::new()
///     .validity_days(365 * 10)
///     .build(&key)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SelfSignedCertBuilder {
    validity_days: u32,
}

impl SelfSignedCertBuilder {
    /// Create a builder producing a zero-length validity window
    pub fn new() -> Self {
        Self::default()
    }

    /// Set validity period in days
    ///
    /// `0` sets `notAfter` equal to `notBefore`.
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Build and sign the certificate with `private_key`
    ///
    /// The public half of `private_key` is embedded in the certificate and the
    /// private half signs it, which makes the certificate self-signed.
    ///
    /// # Errors
    /// Returns [`CryptoError::Allocation`] when an OpenSSL structure cannot be
    /// created and [`CryptoError::Signing`] when a field cannot be set or the
    /// signature fails. Partially built structures are dropped.
    pub fn build(&self, private_key: &PKey<Private>) -> Result<X509, CryptoError> {
        let mut builder = X509::builder().map_err(allocation("x509 certificate"))?;

        let serial = BigNum::from_u32(CERTIFICATE_SERIAL)
            .and_then(|serial| serial.to_asn1_integer())
            .map_err(allocation("serial number"))?;
        builder
            .set_serial_number(&serial)
            .map_err(signing("set the serial number"))?;

        let not_before = Asn1Time::days_from_now(0).map_err(allocation("validity time"))?;
        builder
            .set_not_before(&not_before)
            .map_err(signing("set the start of validity"))?;
        let set_not_after = if self.validity_days == 0 {
            builder.set_not_after(&not_before)
        } else {
            let not_after = Asn1Time::days_from_now(self.validity_days)
                .map_err(allocation("validity time"))?;
            builder.set_not_after(&not_after)
        };
        set_not_after.map_err(signing("set the end of validity"))?;

        builder
            .set_pubkey(private_key)
            .map_err(signing("set the public key"))?;

        let mut name_builder = X509Name::builder().map_err(allocation("subject name"))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, AUTO_SSL_COMMON_NAME)
            .map_err(signing("set the common name"))?;
        let name = name_builder.build();

        builder
            .set_subject_name(&name)
            .map_err(signing("set the subject name"))?;
        // self-signed: issuer is our own subject
        builder
            .set_issuer_name(&name)
            .map_err(signing("set the issuer name"))?;

        builder
            .sign(private_key, MessageDigest::sha256())
            .map_err(signing("create signature"))?;

        Ok(builder.build())
    }
}

/// One-line description of a certificate for log output.
pub fn certificate_summary(certificate: &X509) -> Result<String, ErrorStack> {
    let common_name = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
        .unwrap_or_default();
    let serial = certificate.serial_number().to_bn()?.to_dec_str()?;
    let fingerprint = certificate
        .digest(MessageDigest::sha256())?
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":");

    Ok(format!(
        "CN={} serial={} notBefore={} notAfter={} sha256={}",
        common_name,
        serial,
        certificate.not_before(),
        certificate.not_after(),
        fingerprint
    ))
}
