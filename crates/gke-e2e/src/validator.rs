use anyhow::Result;
use colored::Colorize;

use crate::config::ToolPaths;
use crate::ui;

/// Validates that the external tools a run shells out to are installed.
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    binary: String,
    install_instructions: String,
    critical: bool,
}

/// Result of checking one requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Display name.
    pub name: String,
    /// Resolved location, if found.
    pub location: Option<String>,
    /// Whether a missing tool blocks the run.
    pub critical: bool,
}

impl PrerequisitesValidator {
    #[must_use]
    pub fn new(tools: &ToolPaths) -> Self {
        let requirements = vec![
            Requirement {
                name: "Terraform".to_string(),
                binary: tools.terraform.clone(),
                install_instructions:
                    "Install Terraform from https://developer.hashicorp.com/terraform/install"
                        .to_string(),
                critical: true,
            },
            Requirement {
                name: "gcloud".to_string(),
                binary: tools.gcloud.clone(),
                install_instructions:
                    "Install the Google Cloud CLI from https://cloud.google.com/sdk/docs/install"
                        .to_string(),
                critical: true,
            },
            Requirement {
                name: "kubectl".to_string(),
                binary: tools.kubectl.clone(),
                install_instructions:
                    "Install kubectl from https://kubernetes.io/docs/tasks/tools/".to_string(),
                critical: true,
            },
        ];

        Self { requirements }
    }

    /// Look up every requirement on `PATH` without printing.
    #[must_use]
    pub fn check(&self) -> Vec<CheckOutcome> {
        self.requirements
            .iter()
            .map(|r| CheckOutcome {
                name: r.name.clone(),
                location: which::which(&r.binary)
                    .ok()
                    .map(|p| p.display().to_string()),
                critical: r.critical,
            })
            .collect()
    }

    /// Check and print every requirement.
    ///
    /// # Errors
    ///
    /// Returns an error if a critical tool is missing.
    pub fn validate(&self) -> Result<()> {
        println!();
        let outcomes = self.check();
        let mut failures = Vec::new();

        for (requirement, outcome) in self.requirements.iter().zip(&outcomes) {
            ui::print_check_result(
                &requirement.name,
                outcome.location.is_some(),
                outcome.location.as_deref(),
            );
            if outcome.location.is_none() {
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
        } else {
            ui::print_warning("Some prerequisites are not met:");
            println!();
            for failure in &failures {
                println!(
                    "  {} {} ({}) - {}",
                    "✗".red(),
                    failure.name.red(),
                    failure.binary,
                    failure.install_instructions.bright_black()
                );
            }
            println!();

            if failures.iter().any(|f| f.critical) {
                return Err(anyhow::anyhow!(
                    "Critical prerequisites not met. Please install the required tools and try again."
                ));
            }
        }

        Ok(())
    }
}

impl Default for PrerequisitesValidator {
    fn default() -> Self {
        Self::new(&ToolPaths::default())
    }
}
