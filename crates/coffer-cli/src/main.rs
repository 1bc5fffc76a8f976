use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use coffer_db::CoreError;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod services;

use services::Services;

#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Admin surface for the coffer persistence core", long_about = None)]
struct Cli {
    /// JSON5 config file. Defaults plus COFFER_DB_* overrides when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database connectivity and diagnostics
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Schema management
    Migrate {
        #[command(subcommand)]
        cmd: MigrateCmd,
    },

    /// Snapshot export
    Export {
        #[command(subcommand)]
        cmd: ExportCmd,
    },

    /// Snapshot restore
    Restore(RestoreArgs),

    /// Consistency checks and maintenance probes
    Doctor(DoctorArgs),

    /// Ledger queries
    Ledger {
        #[command(subcommand)]
        cmd: LedgerCmd,
    },

    /// Scheduler jobs
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },

    /// Backup shortcuts
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Round-trip a `SELECT 1` and report latency
    Ping,
    /// Server, schema, pool, health and counter overview
    Info,
}

#[derive(Subcommand)]
enum MigrateCmd {
    /// Report missing tables/columns/indexes without touching anything
    Check,
    /// Run the idempotent DDL pass and record the schema version
    Apply,
}

#[derive(Subcommand)]
enum ExportCmd {
    /// Export all core tables as a JSONL snapshot
    All {
        /// Output directory; defaults to the configured backup outDir
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Gzip the snapshot
        #[arg(long)]
        gzip: bool,
    },
}

#[derive(Args)]
struct RestoreArgs {
    /// fresh | merge
    #[arg(long)]
    mode: String,
    /// atomic | staging (fresh mode only; default atomic)
    #[arg(long)]
    strategy: Option<String>,
    /// Snapshot file, or a directory (newest snapshot wins)
    #[arg(long)]
    from: PathBuf,
    /// Merge mode: replace ledger entries that already exist
    #[arg(long)]
    overwrite: bool,
    /// Disable FOREIGN_KEY_CHECKS for the duration (logged)
    #[arg(long)]
    skip_fk_checks: bool,
    /// Proceed without a .sha256 sidecar
    #[arg(long)]
    allow_missing_checksum: bool,
}

#[derive(Args)]
struct DoctorArgs {
    /// Foreign-key declarations overview
    #[arg(long)]
    fk: bool,
    /// Rows referencing players that do not exist
    #[arg(long)]
    orphans: bool,
    /// Row counts per core table
    #[arg(long)]
    counts: bool,
    /// ANALYZE TABLE over the core tables
    #[arg(long)]
    analyze: bool,
    /// Advisory-lock availability
    #[arg(long)]
    locks: bool,
}

#[derive(Subcommand)]
enum LedgerCmd {
    /// Newest entries
    Recent {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Entries touching one player (uuid or name)
    ByPlayer {
        player: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Entries written by one module
    ByModule {
        module: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Entries whose reason contains a substring
    ByReason {
        needle: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum JobsCmd {
    /// Configured jobs with their next fire times
    List,
    /// Trigger one job and wait for it
    Run { name: String },
}

#[derive(Subcommand)]
enum BackupCmd {
    /// Run the configured backup job once, right now
    Now,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Dev-time .env bootstrap; ignored when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let loaded = match services::load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("ok=false message={e:#}");
            return ExitCode::FAILURE;
        }
    };
    services::init_tracing(&loaded.config.log);

    match run(cli.cmd, loaded).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Surface the structured code when one is anywhere in the chain.
            match e.chain().find_map(|c| c.downcast_ref::<CoreError>()) {
                Some(core) => println!("ok=false code={} message={}", core.code, core.message),
                None => println!("ok=false message={e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cmd: Commands, loaded: coffer_config::LoadedConfig) -> Result<()> {
    let services = Services::connect(loaded).await?;

    match cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Ping => commands::db::ping(&services).await,
            DbCmd::Info => commands::db::info(&services).await,
        },
        Commands::Migrate { cmd } => match cmd {
            MigrateCmd::Check => commands::migrate::check(&services).await,
            MigrateCmd::Apply => commands::migrate::apply(&services).await,
        },
        Commands::Export { cmd } => match cmd {
            ExportCmd::All { out_dir, gzip } => {
                commands::export::all(&services, out_dir, gzip).await
            }
        },
        Commands::Restore(args) => {
            commands::restore::run(
                &services,
                &args.mode,
                args.strategy.as_deref(),
                args.from,
                args.overwrite,
                args.skip_fk_checks,
                args.allow_missing_checksum,
            )
            .await
        }
        Commands::Doctor(args) => {
            let all = !(args.fk || args.orphans || args.counts || args.analyze || args.locks);
            commands::doctor::run(
                &services,
                commands::doctor::Flags {
                    fk: args.fk || all,
                    orphans: args.orphans || all,
                    counts: args.counts || all,
                    analyze: args.analyze || all,
                    locks: args.locks || all,
                },
            )
            .await
        }
        Commands::Ledger { cmd } => match cmd {
            LedgerCmd::Recent { limit } => commands::ledger::recent(&services, limit).await,
            LedgerCmd::ByPlayer { player, limit } => {
                commands::ledger::by_player(&services, &player, limit).await
            }
            LedgerCmd::ByModule { module, limit } => {
                commands::ledger::by_module(&services, &module, limit).await
            }
            LedgerCmd::ByReason { needle, limit } => {
                commands::ledger::by_reason(&services, &needle, limit).await
            }
        },
        Commands::Jobs { cmd } => match cmd {
            JobsCmd::List => commands::jobs::list(&services).await,
            JobsCmd::Run { name } => commands::jobs::run(&services, &name).await,
        },
        Commands::Backup { cmd } => match cmd {
            BackupCmd::Now => commands::jobs::backup_now(&services).await,
        },
    }
}
