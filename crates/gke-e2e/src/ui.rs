//! UI helpers for the smoke-test CLI.
//!
//! Provides consistent formatting for console output during a run.

use colored::Colorize;

use crate::config::E2eConfig;
use crate::orchestrator::RunReport;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print the effective configuration before a run.
pub fn print_config_summary(config: &E2eConfig) {
    println!("{}", "Run Configuration:".cyan().bold());
    println!(
        "  {} {}",
        "Terraform module:".bright_black(),
        config.terraform_dir.display()
    );
    println!(
        "  {} {}",
        "Var files:".bright_black(),
        config.var_files.join(", ")
    );
    println!(
        "  {} {}",
        "Manifest:".bright_black(),
        config.manifest_path.display()
    );
    println!(
        "  {} {} ({}, port {})",
        "Service:".bright_black(),
        config.service_name,
        config.expected_service_type,
        config.service_port
    );
    println!(
        "  {} {} {:?}",
        "Expect:".bright_black(),
        config.expected_status,
        config.expected_body
    );
}

/// Print the outcome of a run.
pub fn print_report(report: &RunReport) {
    print_section("Summary");

    println!("  {} {}", "Run:".bright_black(), report.run_id);
    println!("  {} {}", "Cluster:".bright_black(), report.cluster_name);
    if let Some(ns) = &report.namespace {
        println!("  {} {ns}", "Namespace:".bright_black());
    }
    if let Some(endpoint) = &report.endpoint {
        println!("  {} {endpoint}", "Endpoint:".bright_black());
    }
    let elapsed = report.finished_at - report.started_at;
    println!(
        "  {} {}s",
        "Duration:".bright_black(),
        elapsed.num_seconds()
    );
    println!();

    match (&report.failed_step, &report.error) {
        (_, None) => print_success("Hello-world verification passed"),
        (Some(step), Some(e)) => print_error(&format!("Failed at '{step}': {e}")),
        (None, Some(e)) => print_error(&e.to_string()),
    }

    let failures = report.cleanup_failures();
    if failures.is_empty() {
        if !report.cleanup.is_empty() {
            print_success(&format!("{} cleanup action(s) completed", report.cleanup.len()));
        }
    } else {
        print_warning("Some resources may need manual cleanup:");
        for failure in failures {
            println!(
                "    {} {}",
                "✗".red(),
                failure.label.yellow()
            );
        }
    }
}
