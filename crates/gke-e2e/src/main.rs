//! GKE hello-world smoke test CLI.
//!
//! Provisions a throwaway GKE cluster, deploys a hello-world service,
//! checks it answers over HTTP, and destroys everything it created.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::check::CheckCommand;
use commands::run::RunCommand;

/// GKE hello-world end-to-end smoke test.
#[derive(Parser)]
#[command(
    name = "gke-e2e",
    version,
    about = "Provision GKE, deploy hello-world, verify, tear down",
    long_about = "Run an end-to-end smoke test against Google Kubernetes Engine.\n\n\
                  Creates a cluster with Terraform, deploys a hello-world workload\n\
                  behind a LoadBalancer service, verifies the HTTP response, and\n\
                  removes every resource it created, even when a step fails."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full provision → deploy → verify → teardown cycle.
    Run(RunCommand),

    /// Check that terraform, gcloud and kubectl are installed.
    Check(CheckCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("info,gke_e2e=debug")
    } else {
        EnvFilter::new("warn,gke_e2e=info")
    };

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Run(cmd) => cmd.run().await,
        Commands::Check(cmd) => cmd.run(),
    }
}
