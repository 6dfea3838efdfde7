//! sniffy-ca CLI: manage the proxy's root CA and mint leaf certificates.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sniffy_ca::{load_config, CaConfig, CaService, StoreLocator};

const CERT_FILE_MODE: u32 = 0o644;
const KEY_FILE_MODE: u32 = 0o600;

#[derive(Parser)]
#[command(
    name = "sniffy-ca",
    about = "Self-signed certificate authority for TLS interception",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the root CA, creating it if it does not exist.
    Init {
        /// Storage directory. Defaults to ~/.sniffy.
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// Print the root certificate PEM.
    Root {
        /// Storage directory. Defaults to ~/.sniffy.
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// Issue a leaf certificate for a hostname or IP address.
    Issue {
        /// Hostname or IP address to certify.
        subject: String,

        /// Storage directory. Defaults to ~/.sniffy.
        #[arg(short, long, conflicts_with = "in_memory")]
        dir: Option<String>,

        /// Sign with a throwaway root that is never written to disk.
        #[arg(long)]
        in_memory: bool,

        /// Write `<subject>.crt` and `<subject>.key` here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { dir } => {
            let ca = open_persistent(&config, dir)?;
            let root = ca.root_certificate();
            if let Some(store) = ca.store() {
                println!("Certificate: {}", store.cert_path().display());
                println!("Private key: {}", store.key_path().display());
            }
            println!("Fingerprint: {}", root.fingerprint());
        }
        Commands::Root { dir } => {
            let ca = open_persistent(&config, dir)?;
            print!("{}", ca.root_certificate().pem());
        }
        Commands::Issue {
            subject,
            dir,
            in_memory,
            out,
        } => {
            let ca = if in_memory {
                CaService::new_in_memory_with(&config)?
            } else {
                open_persistent(&config, dir)?
            };

            tracing::info!(subject = %subject, "issuing leaf certificate");
            let bundle = ca.issue_certificate(&subject)?;

            match out {
                Some(out) => {
                    let stem = file_stem(&subject);
                    let cert_path = out.join(format!("{stem}.crt"));
                    let key_path = out.join(format!("{stem}.key"));
                    write_output(&cert_path, &bundle.cert_chain_pem(), CERT_FILE_MODE)?;
                    write_output(&key_path, bundle.private_key_pem(), KEY_FILE_MODE)?;

                    println!("Certificate: {}", cert_path.display());
                    println!("Private key: {}", key_path.display());
                }
                None => {
                    print!("{}", bundle.cert_chain_pem());
                    print!("{}", bundle.private_key_pem());
                }
            }
        }
    }

    Ok(())
}

fn open_persistent(config: &CaConfig, dir: Option<String>) -> anyhow::Result<CaService> {
    let mut config = config.clone();
    if dir.is_some() {
        config.storage_dir = dir;
    }
    let ca = CaService::from_config(&config, &StoreLocator::from_env())
        .context("failed to open certificate authority")?;
    Ok(ca)
}

/// Write `contents` to `path` with the given unix mode, tightening the
/// permissions of a file that already exists.
fn write_output(path: &Path, contents: &str, mode: u32) -> anyhow::Result<()> {
    let context = || format!("failed to write {}", path.display());

    let mut opts = fs::OpenOptions::new();
    opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }

    let mut file = opts.open(path).with_context(context)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .with_context(context)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents.as_bytes()).with_context(context)?;
    Ok(())
}

/// File name for a subject: anything outside `[A-Za-z0-9.-]` becomes `_`.
fn file_stem(subject: &str) -> String {
    if subject.is_empty() {
        return "leaf".to_string();
    }
    subject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
