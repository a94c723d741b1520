use anyhow::Context;
use colored::Colorize;
use serde::Serialize;
use tandem_store::StoreConfig;
use tandem_types::{ReferenceModeStorageKey, StorageKey};

use crate::cli::*;
use crate::scenarios::{self, Report};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.output();
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    match cli.command {
        Command::Simulate(args) => cmd_simulate(args, config, format).await,
        Command::Key(args) => cmd_key(args, format),
    }
}

async fn cmd_simulate(
    args: SimulateArgs,
    config: StoreConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let factory = scenarios::volatile_factory(config);
    let report = scenarios::run(args.scenario, &factory).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    if !report.passed {
        anyhow::bail!("scenario {} failed", report.scenario);
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("Scenario {}", report.scenario.bold());
    for check in &report.checks {
        let mark = if check.passed { "✓".green() } else { "✗".red() };
        println!("  {} {} {}", mark, check.name, format!("({})", check.detail).dimmed());
    }
    if report.passed {
        println!("{} All checks passed.", "✓".green().bold());
    } else {
        println!("{} Scenario failed.", "✗".red().bold());
    }
}

#[derive(Debug, Serialize)]
struct KeyReport {
    key: String,
    protocol: String,
    location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_mode: Option<ReferenceModeParts>,
}

#[derive(Debug, Serialize)]
struct ReferenceModeParts {
    backing: String,
    container: String,
}

fn describe_key(raw: &str) -> anyhow::Result<KeyReport> {
    let key = StorageKey::parse(raw)?;
    let reference_mode = if key.is_reference_mode() {
        let parts = ReferenceModeStorageKey::try_from(&key)?;
        Some(ReferenceModeParts {
            backing: parts.backing.to_string(),
            container: parts.container.to_string(),
        })
    } else {
        None
    };
    Ok(KeyReport {
        key: key.to_string(),
        protocol: key.protocol().to_string(),
        location: key.location().to_string(),
        reference_mode,
    })
}

fn cmd_key(args: KeyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = describe_key(&args.key)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Key {}", report.key.bold());
            println!("  Protocol: {}", report.protocol.cyan());
            println!("  Location: {}", report.location);
            match &report.reference_mode {
                Some(parts) => {
                    println!("  Shape: {}", "reference-mode".yellow());
                    println!("  Backing: {}", parts.backing.blue());
                    println!("  Container: {}", parts.container.blue());
                }
                None => println!("  Shape: {}", "direct".green()),
            }
        }
    }
    Ok(())
}
