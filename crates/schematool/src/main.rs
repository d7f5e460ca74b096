//! `schematool` drives the schema-driven data platform from the command
//! line: importing schemas, creating tables and views, applying
//! permissions, and ingesting NDJSON/GeoJSON files and event streams.

mod commands;
mod migrate;

use clap::Parser;
use cli_common::{init_logging, LogArgs};

#[derive(Debug, Parser)]
#[command(name = "schematool", version, about)]
struct Cli {
    #[command(flatten)]
    log_args: LogArgs,

    /// Location of the dataset schemas: a URL or a filesystem path.
    #[arg(
        long,
        env = "SCHEMA_URL",
        default_value = sources::DEFAULT_SCHEMA_URL,
        global = true
    )]
    schema_url: String,

    /// Location of the profiles.
    #[arg(
        long,
        env = "PROFILES_URL",
        default_value = sources::DEFAULT_PROFILE_URL,
        global = true
    )]
    profiles_url: String,

    /// PostgreSQL connection string.
    #[arg(long = "db-url", env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Load dataset schemas and validate their structure.
    ImportSchemas {
        /// Only this dataset; all datasets when omitted.
        dataset: Option<String>,
    },
    /// Create the tables and indexes for the given datasets.
    CreateTables {
        /// Dataset ids; all datasets when omitted.
        datasets: Vec<String>,
        /// Use the versioned layout: a schema per dataset, version
        /// suffixes on table names.
        #[arg(long)]
        versioned: bool,
        /// Print the statements instead of executing them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the views defined in the given datasets.
    CreateViews {
        datasets: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Derive the role matrix from the schemas and apply GRANTs.
    ApplyPermissions {
        datasets: Vec<String>,
        /// Create one scope_<scope> role per scope and grant each its
        /// own slice. Without this, --role and --scope select a single
        /// grantee.
        #[arg(long, conflicts_with_all = ["role", "scope"])]
        auto: bool,
        #[arg(long, requires = "scope")]
        role: Option<String>,
        #[arg(long, requires = "role")]
        scope: Option<String>,
        /// Revoke existing privileges before granting.
        #[arg(long)]
        revoke: bool,
        /// Create missing roles on the fly.
        #[arg(long)]
        create_roles: bool,
        /// Also grant table access for profiles carrying --scope.
        #[arg(long, requires = "scope")]
        with_profiles: bool,
        #[arg(long, default_value = "public")]
        pg_schema: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Import an NDJSON file into one table.
    ImportNdjson {
        dataset: String,
        table: String,
        file: std::path::PathBuf,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
    /// Import a GeoJSON FeatureCollection into one table.
    ImportGeojson {
        dataset: String,
        table: String,
        file: std::path::PathBuf,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
    /// Replay an event file into the active tables.
    ImportEvents {
        file: std::path::PathBuf,
        /// Datasets the events touch (relations included via prefetch).
        #[arg(long = "dataset", required = true)]
        datasets: Vec<String>,
        /// Process the file as one batch, taking the full-load shortcut.
        #[arg(long)]
        bulk: bool,
        /// Treat the file as a redelivered batch.
        #[arg(long)]
        recovery: bool,
        /// Empty the destination tables first.
        #[arg(long)]
        truncate: bool,
    },
    /// Print the DDL migrating a table between two versions.
    SqlMigrateSchema {
        dataset: String,
        table: String,
        from_version: String,
        to_version: String,
    },
    /// Write a table's rows back out as ADD events.
    ExportEvents {
        dataset: String,
        table: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_args);
    commands::run(cli)
}
