//! Clinic ingest CLI.

use clap::Parser;
use serde::Serialize;

use clinic_ingest_lib::config::{self, IngestConfig};
use clinic_ingest_lib::pipeline::{
    run_formulary_refresh, run_import, run_verification, IngestError, JsonFileSource,
};

mod cli;

use crate::cli::{Cli, Command};

fn main() {
    clinic_ingest_lib::init_tracing();
    let cli = Cli::parse();

    let exit_code = match execute(&cli) {
        Ok(clean) => {
            if clean {
                0
            } else {
                1
            }
        }
        Err(error) => {
            eprintln!("error: {error}");
            1
        }
    };
    std::process::exit(exit_code);
}

/// Returns whether the run finished without per-item errors.
fn execute(cli: &Cli) -> Result<bool, IngestError> {
    let ingest_config = build_config(cli)?;
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match &cli.command {
        Command::Import { input, derive } => {
            let summary = run_import(&ingest_config, &JsonFileSource::new(input), *derive)?;
            print_json(&summary);
            Ok(summary.is_clean())
        }
        Command::RefreshFormulary { input } => {
            let report = run_formulary_refresh(&ingest_config, input)?;
            print_json(&report);
            Ok(report.total_errors() == 0)
        }
        Command::Verify => {
            let report = run_verification(&ingest_config)?;
            print_json(&report);
            Ok(!report.has_duplicates())
        }
    }
}

/// CLI flags win over the environment. clap already folds the database and
/// batch-size variables into the flags.
fn build_config(cli: &Cli) -> Result<IngestConfig, IngestError> {
    let database = cli.database.as_ref().map(|path| path.display().to_string());
    let batch_size = cli.batch_size.map(|n| n.to_string());

    let ingest_config = IngestConfig::from_lookup(|key| match key {
        config::ENV_DATABASE_PATH if database.is_some() => database.clone(),
        config::ENV_BATCH_SIZE if batch_size.is_some() => batch_size.clone(),
        _ => std::env::var(key).ok(),
    })?;
    Ok(ingest_config)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(error) => eprintln!("error: could not render report: {error}"),
    }
}
