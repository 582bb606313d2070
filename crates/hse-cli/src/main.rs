mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hse_migrate::report::{render_sources, render_summary};
use hse_migrate::{data_dir_from_env, source_statuses, MigrateConfig, WriteStrategy};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "hse-migrate")]
#[command(about = "Migrate OTP program JSON exports into the HSE datastore")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert every configured source document (default)
    Migrate(MigrateArgs),
    /// List the configured source files and whether they exist
    Sources {
        /// Directory holding the JSON exports [env: HSE_DATA_DIR, default ./lib]
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct MigrateArgs {
    /// Directory holding the JSON exports [env: HSE_DATA_DIR, default ./lib]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use native upserts; needs unique constraints on both natural keys
    #[arg(long)]
    on_conflict: bool,

    /// Reconcile against an in-memory store; no credentials needed
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Variables already in the environment take precedence over both files.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    logging::init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Migrate(MigrateArgs::default())) {
        Commands::Migrate(args) => migrate(args).await?,
        Commands::Sources { data_dir } => {
            let data_dir = data_dir.unwrap_or_else(data_dir_from_env);
            println!("data dir: {}", data_dir.display());
            println!("{}", render_sources(&source_statuses(&data_dir)));
        }
    }

    Ok(())
}

async fn migrate(args: MigrateArgs) -> Result<()> {
    let strategy = if args.on_conflict {
        WriteStrategy::OnConflict
    } else {
        WriteStrategy::LookupThenWrite
    };

    let stats = if args.dry_run {
        let data_dir = args.data_dir.unwrap_or_else(data_dir_from_env);
        warn!(data_dir = %data_dir.display(), "dry run: writes go to an in-memory store");
        hse_migrate::run_dry(data_dir, strategy).await
    } else {
        let mut config = MigrateConfig::from_env().context(
            "datastore credentials missing; set NEXT_PUBLIC_SUPABASE_URL and \
             SUPABASE_SERVICE_ROLE_KEY (for example in .env.local)",
        )?;
        if let Some(data_dir) = args.data_dir {
            config.data_dir = data_dir;
        }
        info!(data_dir = %config.data_dir.display(), "starting migration");
        hse_migrate::run_once(&config, strategy).await?
    };

    println!("{}", render_summary(&stats));
    Ok(())
}
