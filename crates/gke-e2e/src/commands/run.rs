use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use gke_e2e::config::E2eConfig;
use gke_e2e::orchestrator::HelloWorldTest;
use gke_e2e::shell::SystemRunner;
use gke_e2e::ui;
use gke_e2e::validator::PrerequisitesValidator;

/// Run the hello-world smoke test
#[derive(Args)]
pub struct RunCommand {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Terraform module directory
    #[arg(long, value_name = "DIR")]
    terraform_dir: Option<PathBuf>,

    /// Workload manifest to apply
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Write a JSON report of the run to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Skip the prerequisites check
    #[arg(long)]
    skip_checks: bool,
}

impl RunCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("GKE hello-world smoke test");

        let config = self.load_config()?;

        if !self.skip_checks {
            PrerequisitesValidator::new(&config.tools).validate()?;
        }

        ui::print_config_summary(&config);
        println!();

        let test = HelloWorldTest::new(config, Arc::new(SystemRunner))?;
        let report = test.run().await;

        ui::print_report(&report);

        if let Some(path) = &self.report {
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            ui::print_info(&format!("Report written to {}", path.display()));
        }

        report.into_result()?;
        Ok(())
    }

    fn load_config(&self) -> Result<E2eConfig> {
        let mut config = if let Some(path) = &self.config {
            E2eConfig::load(path)?
        } else {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            E2eConfig::with_defaults(cwd)
        };

        if let Some(dir) = &self.terraform_dir {
            config.terraform_dir.clone_from(dir);
            if self.manifest.is_none() && self.config.is_none() {
                config.manifest_path = dir.join("hello-world-deployment.yml");
            }
        }
        if let Some(manifest) = &self.manifest {
            config.manifest_path.clone_from(manifest);
        }

        config.validate()?;
        Ok(config)
    }
}
