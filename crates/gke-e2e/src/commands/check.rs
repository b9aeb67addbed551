use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use gke_e2e::config::E2eConfig;
use gke_e2e::ui;
use gke_e2e::validator::PrerequisitesValidator;

/// Check that the required CLIs are installed
#[derive(Args)]
pub struct CheckCommand {
    /// Configuration file path (for custom tool binaries)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl CheckCommand {
    pub fn run(&self) -> Result<()> {
        ui::print_section("Prerequisites");

        let config = match &self.config {
            Some(path) => E2eConfig::load(path)?,
            None => E2eConfig::default(),
        };

        PrerequisitesValidator::new(&config.tools).validate()
    }
}
