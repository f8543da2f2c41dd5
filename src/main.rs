//! Auto SSL - administrative command line
//!
//! ```bash
//! # Turn SSL on and generate credentials when the node requires it
//! auto-ssl --config auto-ssl.toml setup
//!
//! # Upgrade path: restore sslmode=prefer for outbound connections
//! auto-ssl reset-conninfo
//!
//! # Show current SSL state
//! auto-ssl status
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use auto_ssl::bootstrap::{
    reset_default_for_node_conninfo, Bootstrap, BootstrapOutcome, RsaSelfSigned,
};
use auto_ssl::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use auto_ssl::credential_store::CredentialStore;
use auto_ssl::generate_self_signed::certificate_summary;
use auto_ssl::host::{HostConfig, ReloadOutcome};
use auto_ssl::policy::should_auto_enable;
use clap::{Parser, Subcommand};
use openssl::x509::X509;
use tracing_subscriber::EnvFilter;

/// Automatic SSL bootstrap for cluster nodes
#[derive(Parser, Debug)]
#[command(name = "auto-ssl", version)]
#[command(about = "Turn on SSL and generate self-signed credentials for a cluster node")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable SSL and create a key and certificate when none exist
    Setup,
    /// Pin the outbound connection string back to sslmode=prefer
    ResetConninfo,
    /// Print the SSL state of the node
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)
        .context(format!("Failed to load configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Setup => setup(&config),
        Command::ResetConninfo => reset_conninfo(&config),
        Command::Status => status(&config),
    }
}

fn setup(config: &AppConfig) -> Result<()> {
    let mut host = config.open_host()?;
    let material = RsaSelfSigned::new(config.certificate_builder());

    let outcome = Bootstrap::with_material_source(&mut host, material)
        .run()
        .context("SSL bootstrap failed")?;

    match outcome {
        BootstrapOutcome::AlreadyEnabled => println!("✓ SSL already enabled, nothing to do"),
        BootstrapOutcome::PolicyDeclined => {
            println!("✓ Outbound connections do not require SSL, leaving it off")
        }
        BootstrapOutcome::CredentialsPresent => {
            println!("✓ SSL enabled, using the certificate already installed")
        }
        BootstrapOutcome::CertificateCheckUnavailable => {
            println!("✓ SSL enabled");
            println!("⚠ Could not check for an installed certificate, none was generated");
        }
        BootstrapOutcome::Generated { reload } => {
            let paths = host.credential_paths();
            println!("✓ SSL enabled");
            println!("✓ Private key written to {}", paths.private_key_path.display());
            println!("✓ Certificate written to {}", paths.certificate_path.display());
            print_reload(reload);
        }
    }
    Ok(())
}

fn reset_conninfo(config: &AppConfig) -> Result<()> {
    let mut host = config.open_host()?;
    let reload = reset_default_for_node_conninfo(&mut host)
        .context("Failed to reset outbound connection string")?;
    println!("✓ Outbound connection string reset to sslmode=prefer");
    print_reload(reload);
    Ok(())
}

fn status(config: &AppConfig) -> Result<()> {
    let host = config.open_host()?;
    let policy = host.outbound_connection_policy();
    let store = CredentialStore::new(host.credential_paths());
    let files = store.files();

    println!("\n=== Auto SSL Status ===");
    println!("SSL enabled:          {}", host.is_encryption_enabled());
    println!("Outbound sslmode:     {}", policy.effective_sslmode());
    println!("Auto SSL applies:     {}", should_auto_enable(&policy));
    println!("Private key file:     {}", files.private_key_path.display());
    println!("Certificate file:     {}", files.certificate_path.display());

    if store.exists() {
        let pem = std::fs::read(&files.certificate_path)
            .context("Failed to read certificate file")?;
        let certificate = X509::from_pem(&pem).context("Failed to parse certificate")?;
        println!("Certificate:          {}", certificate_summary(&certificate)?);
    } else {
        println!("Certificate:          none");
    }
    Ok(())
}

fn print_reload(reload: ReloadOutcome) {
    match reload {
        ReloadOutcome::Reloaded => println!("✓ Configuration reloaded"),
        ReloadOutcome::RestartRequired => {
            println!("⚠ Restart required for the SSL settings to take effect")
        }
    }
}
