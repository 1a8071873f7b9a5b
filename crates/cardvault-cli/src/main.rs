//! Cardvault Command-Line Tool
//!
//! Inspects a card store and runs schema migrations against it.

mod commands;
mod error;
mod formatter;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{Context, OpenOptions};
use formatter::{render, OutputFormat};

/// Cardvault Command-Line Tool
#[derive(Parser, Debug)]
#[command(name = "cardvault")]
#[command(version, about = "Cardvault store inspection and schema migration")]
pub struct Args {
    /// Path to the card store
    #[arg(short = 'd', long, default_value = "./cardvault-data", global = true)]
    pub data_path: PathBuf,

    /// Directory holding the schema version marker
    #[arg(long, global = true)]
    pub marker_dir: Option<PathBuf>,

    /// Storage quota in MB; omit when the host quota is unknown
    #[arg(long, global = true)]
    pub quota_mb: Option<u64>,

    /// Version assumed for a store without a version marker
    #[arg(long, default_value_t = 1, global = true)]
    pub initial_version: u32,

    /// Output format
    #[arg(long, default_value = "text", value_enum, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show schema version, card count, and the last migration
    Status,

    /// Check whether a migration may be attempted
    Validate {
        /// Source version (defaults to the current version)
        #[arg(long)]
        from: Option<u32>,
        /// Target version (defaults to the latest supported)
        #[arg(long)]
        to: Option<u32>,
    },

    /// Migrate to a target version
    Migrate {
        /// Target version (defaults to the latest supported)
        #[arg(long)]
        to: Option<u32>,
        /// Keep only the newest N backups after a completed migration
        #[arg(long)]
        keep_backups: Option<usize>,
    },

    /// Scan cards for corruption
    Integrity,

    /// List backups
    Backups {
        /// Delete all but the newest N backups
        #[arg(long)]
        prune: Option<usize>,
    },

    /// Show migration history
    Logs,

    /// Import cards from a JSON array
    Import {
        /// JSON file to import
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cardvault=info,cardvault_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let marker_dir = args
        .marker_dir
        .clone()
        .unwrap_or_else(|| args.data_path.join("markers"));
    let keep_backups = match &args.command {
        Command::Migrate { keep_backups, .. } => *keep_backups,
        _ => None,
    };

    let ctx = Context::open(OpenOptions {
        data_path: &args.data_path,
        marker_dir: &marker_dir,
        quota_mb: args.quota_mb,
        initial_version: args.initial_version,
        keep_backups,
    })
    .await?;

    let format = args.format;
    let result = execute(&ctx, args.command, format).await;
    ctx.close().await?;
    result
}

async fn execute(
    ctx: &Context,
    command: Command,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Status => {
            println!("{}", render(&commands::status(ctx).await?, format)?);
        }
        Command::Validate { from, to } => {
            let result = commands::validate(ctx, from, to).await?;
            println!("{}", render(&result, format)?);
            if !result.is_valid {
                return Err(Box::new(error::Error::MigrationFailed(result.errors.join("; "))));
            }
        }
        Command::Migrate { to, .. } => {
            let outcome = commands::migrate(ctx, to).await;
            println!("{}", render(&outcome, format)?);
            commands::ensure_success(&outcome)?;
        }
        Command::Integrity => {
            println!("{}", render(&commands::integrity(ctx).await?, format)?);
        }
        Command::Backups { prune } => {
            println!("{}", render(&commands::backups(ctx, prune).await?, format)?);
        }
        Command::Logs => {
            println!("{}", render(&commands::logs(ctx).await?, format)?);
        }
        Command::Import { file } => {
            println!("{}", render(&commands::import(ctx, &file).await?, format)?);
        }
    }
    Ok(())
}
