//! Shared context for command handlers.
//!
//! A `Services` value is built once per invocation and passed explicitly;
//! there is no process-global registry. Hosts embedding the core build the
//! same shape from the library crates.

use anyhow::{Context, Result};
use coffer_config::{LoadedConfig, LogConfig};
use coffer_db::ledger::LedgerMirror;
use coffer_db::{Db, Wallet};
use coffer_events::EventBus;
use std::path::Path;
use std::sync::Arc;

/// Event bus workers for the one-shot admin process. Hosts size this to
/// their player counts; the CLI only ever sees its own traffic.
const CLI_BUS_WORKERS: usize = 2;

pub struct Services {
    pub loaded: LoadedConfig,
    pub db: Db,
    pub bus: EventBus,
    pub wallet: Wallet,
}

impl Services {
    pub async fn connect(loaded: LoadedConfig) -> Result<Services> {
        let db = Db::connect(&loaded.config).await?;
        coffer_db::health::spawn_probe(
            db.clone(),
            std::time::Duration::from_secs(loaded.config.runtime.reconnect_every_s),
        );
        let bus = EventBus::new(CLI_BUS_WORKERS);

        let mut wallet = Wallet::new(db.clone()).with_bus(bus.clone());
        if loaded.config.modules.ledger.file.enabled {
            let mirror = LedgerMirror::open(&loaded.config.modules.ledger.file.path)
                .context("open ledger file mirror")?;
            wallet = wallet.with_mirror(Arc::new(mirror));
        }

        Ok(Services {
            loaded,
            db,
            bus,
            wallet,
        })
    }

    pub fn config(&self) -> &coffer_config::CoreConfig {
        &self.loaded.config
    }
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    match path {
        Some(path) => coffer_config::load_file(path),
        None => coffer_config::load_defaults(),
    }
}

/// Structured logging per the `log` config section: env-filter seeded from
/// `log.level` (RUST_LOG still wins), JSON formatter when `log.json`.
pub fn init_tracing(log: &LogConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    if log.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// `key=value` result line helper shared by every command.
pub fn print_kv(pairs: &[(&str, String)]) {
    let line: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    println!("{}", line.join(" "));
}
