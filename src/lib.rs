//! Auto SSL - Automatic transport encryption bootstrap for cluster nodes
//!
//! When a node is installed without SSL but its outbound connection policy
//! requires SSL towards the other nodes, the cluster is assumed to expect
//! encrypted connections everywhere. This library turns SSL on at the host
//! level and makes sure a usable key and certificate exist, generating a
//! self-signed pair when none are installed.
//!
//! # Overview
//!
//! ```text
//! Bootstrap
//!   ├── policy::should_auto_enable      (sslmode=require?)
//!   ├── HostConfig::enable_encryption   (persist ssl = on)
//!   ├── CredentialStore::exists         (certificate already installed?)
//!   ├── generate_keypair                (RSA-2048, e = 65537)
//!   ├── SelfSignedCertBuilder::build    (CN=citus-auto-ssl, SHA-256)
//!   ├── CredentialStore::persist        (key PEM, then certificate PEM)
//!   └── HostConfig::reload_live_configuration
//! ```
//!
//! Exactly one self-signed leaf pair is produced per node. Once a loadable
//! certificate is in place it is never inspected or replaced.
//!
//! # Example
//!
//! ```no_run
//! use auto_ssl::bootstrap::{Bootstrap, BootstrapOutcome};
//! use auto_ssl::host::FileHostConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut host = FileHostConfig::open("data", "auto-ssl.conf.toml", true)?;
//!
//!     match Bootstrap::new(&mut host).run()? {
//!         BootstrapOutcome::Generated { reload } => println!("credentials generated ({:?})", reload),
//!         outcome => println!("nothing generated: {:?}", outcome),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! A run is synchronous and sequential. The span from the existence check to
//! the final write is guarded by an advisory lock on the directory holding
//! the certificate, so two runs on the same paths cannot both generate
//! credentials. Taking the lock creates no files.
//!
//! # Error Handling
//!
//! Library operations return typed errors from [`error`]; every error is fatal
//! to the run. A failed certificate write after a successful key write leaves
//! the key on disk for the administrator to clean up or re-run.

pub mod bootstrap;
pub mod configs;
pub mod credential_store;
pub mod error;
pub mod generate_keypair;
pub mod generate_self_signed;
pub mod host;
pub mod policy;
pub mod secure_key;
