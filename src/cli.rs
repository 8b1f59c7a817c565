//! Command-line arguments for the clinic ingest tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use clinic_ingest_lib::config::{ENV_BATCH_SIZE, ENV_DATABASE_PATH};

#[derive(Parser)]
#[command(
    name = "clinic-ingest",
    version,
    about = "Load clinic dispensing logs, formularies and rosters into the records database",
    long_about = "Load clinic dispensing logs, formularies, staff rosters and site metadata \
                  into the records database.\n\n\
                  Sites, medications and persons are matched on their identity keys, so \
                  re-running an import never duplicates them. Dispensing records are \
                  append-only."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database file (default: <data dir>/ClinicIngest/clinic.db).
    #[arg(long = "db", value_name = "PATH", env = ENV_DATABASE_PATH, global = true)]
    pub database: Option<PathBuf>,

    /// Rows per bulk existence check and bulk insert.
    #[arg(long = "batch-size", value_name = "N", env = ENV_BATCH_SIZE, global = true)]
    pub batch_size: Option<usize>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import a JSON bundle of sites, medications, persons and dispensing logs.
    Import {
        #[arg(value_name = "JSON")]
        input: PathBuf,

        /// Derive missing medications and staff from the dispensing logs.
        #[arg(long)]
        derive: bool,
    },

    /// Delete every medication and reload the formulary from a CSV export.
    RefreshFormulary {
        #[arg(value_name = "CSV")]
        input: PathBuf,
    },

    /// Report duplicate medications and stock totals.
    Verify,
}
