//! Issue Autopilot CLI
//!
//! Replays scripted scenarios through the pipeline and checks configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use autopilot::{Error, PipelineConfig, Result, Scenario, Validate};

#[derive(Debug, Parser)]
#[command(name = "autopilot", version, about = "Drive issues through the resolution pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a YAML scenario against scripted collaborators
    Run {
        /// Scenario file
        scenario: PathBuf,

        /// Pipeline configuration (TOML), overriding the scenario's own
        #[arg(long, env = "AUTOPILOT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Validate a pipeline configuration file
    CheckConfig {
        /// Configuration file (TOML)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so results on stdout stay parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run { scenario, config } => run_scenario(&scenario, config.as_deref()).await,
        Command::CheckConfig { path } => check_config(&path),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_scenario(path: &Path, config: Option<&Path>) -> Result<ExitCode> {
    let mut scenario = Scenario::load(path)?;
    if let Some(config) = config {
        scenario.config = Some(PipelineConfig::load(config)?);
    }

    let report = scenario.run().await?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| Error::Internal(format!("failed to encode report: {}", e)))?;
    println!("{}", json);

    let Some(expect) = &scenario.expect else {
        return Ok(ExitCode::SUCCESS);
    };
    let mismatches = report.mismatches(expect);
    if mismatches.is_empty() {
        tracing::info!(scenario = %scenario.name, "scenario matched expectations");
        return Ok(ExitCode::SUCCESS);
    }
    for mismatch in &mismatches {
        eprintln!("mismatch: {}", mismatch);
    }
    Ok(ExitCode::FAILURE)
}

fn check_config(path: &Path) -> Result<ExitCode> {
    let config = PipelineConfig::load(path)?;
    let validation = config.validate();

    for warning in &validation.warnings {
        println!("warning: {}", warning);
    }
    for error in &validation.errors {
        println!("error: {}", error);
    }

    if validation.is_valid() {
        println!("{}: ok", path.display());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
