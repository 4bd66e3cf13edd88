// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chartsync CLI entry point.

mod engine;
mod listen;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use chartsync::snapshot::load_subject;
use chartsync::Registry;

use engine::EngineOptions;

#[derive(Parser)]
#[command(
    name = "chartsync",
    about = "Acquire and normalize patient records from the medical-records portal",
    version
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Portal connection flags shared by `fetch` and `listen`.
#[derive(clap::Args, Clone)]
struct PortalArgs {
    /// Portal origin, overriding the config file.
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token. Also reads from CHARTSYNC_TOKEN env var.
    #[arg(long)]
    token: Option<String>,

    /// Page URL the subject is read from (e.g. one carrying ?pid=...).
    #[arg(long)]
    page_url: Option<String>,

    /// Directory for persisted snapshots (default: ~/.chartsync/snapshots).
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Keep snapshots in memory only.
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full batch and print the completion as JSON.
    Fetch {
        #[command(flatten)]
        portal: PortalArgs,

        /// Fetch a single data type instead of a batch.
        #[arg(long)]
        data_type: Option<String>,
    },

    /// Read control messages as JSON lines on stdin; print events and acks.
    Listen {
        #[command(flatten)]
        portal: PortalArgs,
    },

    /// Print the persisted snapshot for a subject fingerprint.
    Snapshot {
        fingerprint: String,

        /// Directory for persisted snapshots (default: ~/.chartsync/snapshots).
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },

    /// List the known data types and their endpoints.
    Registry,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   chartsync completions bash > ~/.local/share/bash-completion/completions/chartsync
    ///   chartsync completions zsh > ~/.zfunc/_chartsync
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn engine_options(config: Option<String>, portal: PortalArgs) -> EngineOptions {
    EngineOptions {
        config,
        base_url: portal.base_url,
        token: portal.token,
        page_url: portal.page_url,
        snapshot_dir: portal.snapshot_dir,
        ephemeral: portal.ephemeral,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fetch { portal, data_type } => {
            let orchestrator = engine::build(engine_options(cli.config, portal))?;
            match data_type {
                Some(key) => {
                    let outcome = orchestrator
                        .fetch_by_key(&key)
                        .await
                        .with_context(|| format!("fetching {key} failed"))?;
                    let records = orchestrator.store().records(outcome.data_type);
                    let output = serde_json::json!({
                        "outcome": outcome,
                        "data": records,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                None => {
                    let completion = orchestrator.run_batch().await.context("batch failed")?;
                    println!("{}", serde_json::to_string_pretty(&completion)?);
                }
            }
        }

        Commands::Listen { portal } => {
            let orchestrator = engine::build(engine_options(cli.config, portal))?;
            listen::run(Arc::new(orchestrator)).await?;
        }

        Commands::Snapshot {
            fingerprint,
            snapshot_dir,
        } => {
            let store = engine::open_snapshots(snapshot_dir, false)?;
            match load_subject(store.as_ref(), &fingerprint)
                .with_context(|| format!("failed to read snapshot for {fingerprint}"))?
            {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => {
                    eprintln!("No snapshot for {fingerprint}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Registry => {
            let registry = Registry::standard();
            let descriptors: Vec<_> = registry.iter().collect();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "chartsync", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_flags_parse() {
        let cli = Cli::parse_from([
            "chartsync",
            "fetch",
            "--base-url",
            "https://portal.example",
            "--page-url",
            "https://portal.example/imu/?pid=A1",
            "--data-type",
            "allergy",
            "--ephemeral",
        ]);
        let Commands::Fetch { portal, data_type } = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(portal.base_url.as_deref(), Some("https://portal.example"));
        assert_eq!(data_type.as_deref(), Some("allergy"));
        assert!(portal.ephemeral);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["chartsync", "registry", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Registry));
    }
}
