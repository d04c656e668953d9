//! CLI tool for the local root CA
//!
//! Usage:
//!   hiresproxy-ca ensure
//!   hiresproxy-ca show [--json]
//!   hiresproxy-ca export <path> [--force]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hiresproxy::certificate::common_name;
use hiresproxy::{CaConfig, CertificateManager};
use std::fs;
use std::path::PathBuf;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Manage the HiresProxy root certificate authority
#[derive(Parser, Debug)]
#[command(name = "hiresproxy-ca")]
#[command(author = "HiresProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage the HiresProxy root certificate authority")]
struct Args {
    /// Root CA directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Root CA common name
    #[arg(long, env = "CA_NAME", default_value = "HiresProxy Root CA")]
    ca_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the root CA unless one already exists
    Ensure,

    /// Print details of the existing root CA
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the root certificate (PEM) for manual installation
    Export {
        /// Destination file
        path: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let manager = CertificateManager::new(&CaConfig {
        dir: args.certs_dir,
        common_name: args.ca_name,
    });

    match args.command {
        Commands::Ensure => {
            let existed = manager.exists();
            let ca = manager.ensure()?;

            if existed {
                println!("Root CA '{}' already present", ca.identity());
            } else {
                println!("Generated root CA '{}'", ca.identity());
            }
            println!("  Certificate: {}", manager.cert_path().display());
            println!("  Key:         {}", manager.key_path().display());
        }

        Commands::Show { json } => {
            if !manager.exists() {
                eprintln!("No root CA in {}", manager.certs_dir().display());
                std::process::exit(1);
            }

            let ca = manager.ensure()?;
            let (_, cert) = X509Certificate::from_der(ca.cert_der().as_ref())
                .map_err(|e| anyhow!("Failed to parse root certificate: {}", e))?;

            let issuer = common_name(cert.issuer()).unwrap_or_default();
            let not_before = cert.validity().not_before.to_datetime();
            let not_after = cert.validity().not_after.to_datetime();
            let serial = cert.raw_serial_as_string();

            if json {
                let output = serde_json::json!({
                    "identity": ca.identity(),
                    "issuer": issuer,
                    "serial": serial,
                    "not_before": not_before.to_string(),
                    "not_after": not_after.to_string(),
                    "certificate": manager.cert_path(),
                    "key": manager.key_path(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("  Identity:    {}", ca.identity());
                println!("  Issuer:      {}", issuer);
                println!("  Serial:      {}", serial);
                println!("  Not before:  {}", not_before);
                println!("  Not after:   {}", not_after);
                println!("  Certificate: {}", manager.cert_path().display());
            }
        }

        Commands::Export { path, force } => {
            if !manager.exists() {
                eprintln!("No root CA in {}, run `hiresproxy-ca ensure` first", manager.certs_dir().display());
                std::process::exit(1);
            }
            if path.exists() && !force {
                eprintln!("{} already exists, use --force to replace it", path.display());
                std::process::exit(1);
            }

            let ca = manager.ensure()?;
            fs::write(&path, ca.cert_pem())
                .with_context(|| format!("Failed to write {}", path.display()))?;

            println!("Exported root CA '{}' to {}", ca.identity(), path.display());
        }
    }

    Ok(())
}
