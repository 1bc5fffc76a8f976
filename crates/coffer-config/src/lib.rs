//! Operator configuration for the coffer core.
//!
//! The config file is JSON5 (comments and trailing commas permitted). The
//! loader parses the file into [`CoreConfig`], applies `COFFER_DB_*`
//! environment overrides, and computes a canonical-JSON SHA-256 hash of the
//! effective configuration so operators can tell at a glance whether two
//! nodes run the same settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub const ENV_DB_HOST: &str = "COFFER_DB_HOST";
pub const ENV_DB_PORT: &str = "COFFER_DB_PORT";
pub const ENV_DB_DATABASE: &str = "COFFER_DB_DATABASE";
pub const ENV_DB_USER: &str = "COFFER_DB_USER";
pub const ENV_DB_PASSWORD: &str = "COFFER_DB_PASSWORD";

/// Documented defaults shipped in the sample config. Connecting with these
/// against anything but a throwaway dev database is a misconfiguration.
pub const DEFAULT_DB_USER: &str = "coffer";
pub const DEFAULT_DB_PASSWORD: &str = "coffer";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub db: DbConfig,
    pub runtime: RuntimeConfig,
    pub modules: ModulesConfig,
    pub log: LogConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            runtime: RuntimeConfig::default(),
            modules: ModulesConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub tls: TlsConfig,
    pub session: SessionConfig,
    pub pool: PoolConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            database: "coffer".to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: DEFAULT_DB_PASSWORD.to_string(),
            tls: TlsConfig::default(),
            session: SessionConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl DbConfig {
    /// `true` when the configured host is loopback. TLS warnings only apply
    /// to non-loopback hosts.
    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    /// `true` when the credentials are the documented sample defaults.
    pub fn uses_default_credentials(&self) -> bool {
        self.user == DEFAULT_DB_USER && self.password == DEFAULT_DB_PASSWORD
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Pin every pooled session to UTC (`SET time_zone = '+00:00'`).
    pub force_utc: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { force_utc: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub max_pool_size: u32,
    pub minimum_idle: u32,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub startup_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            minimum_idle: 2,
            connection_timeout_ms: 10_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: 1_800_000,
            startup_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Health probe cadence in seconds.
    pub reconnect_every_s: u64,
    /// Operator-visible node name stamped into ledger rows.
    pub server_node: Option<String>,
    /// IANA zone recorded in snapshot headers. Display-side conversion is
    /// the host's concern; coffer only validates and carries the string.
    pub default_zone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_every_s: 10,
            server_node: None,
            default_zone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModulesConfig {
    pub ledger: LedgerConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerConfig {
    pub enabled: bool,
    /// Ledger rows older than this horizon are pruned. 0 disables pruning.
    pub retention_days: u32,
    pub file: LedgerFileConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 0,
            file: LedgerFileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerFileConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for LedgerFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "logs/ledger.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub jobs: JobsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jobs: JobsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobsConfig {
    pub backup: BackupJobConfig,
    pub cleanup: CleanupJobsConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backup: BackupJobConfig::default(),
            cleanup: CleanupJobsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissedFirePolicy {
    Skip,
    RunAtNextStartup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupJobConfig {
    pub enabled: bool,
    /// 6-field cron, UTC.
    pub schedule: String,
    pub out_dir: String,
    pub on_missed: MissedFirePolicy,
    pub gzip: bool,
    pub prune: PruneConfig,
}

impl Default for BackupJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 30 4 * * *".to_string(),
            out_dir: "backups".to_string(),
            on_missed: MissedFirePolicy::Skip,
            gzip: true,
            prune: PruneConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneConfig {
    pub keep_days: u32,
    pub keep_max: u32,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            keep_days: 14,
            keep_max: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupJobsConfig {
    pub idempotency_sweep: SweepJobConfig,
}

impl Default for CleanupJobsConfig {
    fn default() -> Self {
        Self {
            idempotency_sweep: SweepJobConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SweepJobConfig {
    pub enabled: bool,
    pub schedule: String,
    /// Optional extra horizon narrowing the sweep: expired rows are only
    /// reclaimed once also older than `now - retentionDays`. 0 disables.
    pub retention_days: u32,
    pub batch_limit: u32,
}

impl Default for SweepJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 15 * * * *".to_string(),
            retention_days: 0,
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub json: bool,
    pub slow_query_ms: u64,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            slow_query_ms: 250,
            level: "info".to_string(),
        }
    }
}

/// A parsed configuration plus its canonical hash.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: CoreConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load a JSON5 config file, apply env overrides, canonicalize and hash.
pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("read config: {:?}", path))?;
    load_str(&raw)
}

/// Same as [`load_file`] for in-memory JSON5 text.
pub fn load_str(raw: &str) -> Result<LoadedConfig> {
    let mut config: CoreConfig = json5::from_str(raw).context("parse config (json5)")?;
    apply_env_overrides(&mut config)?;
    finish(config)
}

/// Defaults plus env overrides, for hosts that run without a config file.
pub fn load_defaults() -> Result<LoadedConfig> {
    let mut config = CoreConfig::default();
    apply_env_overrides(&mut config)?;
    finish(config)
}

fn finish(config: CoreConfig) -> Result<LoadedConfig> {
    validate(&config)?;

    let value = serde_json::to_value(&config).context("config to json")?;
    let canonical = canonicalize_json(&value);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// `COFFER_DB_*` variables override the corresponding file fields.
fn apply_env_overrides(config: &mut CoreConfig) -> Result<()> {
    if let Ok(host) = std::env::var(ENV_DB_HOST) {
        config.db.host = host;
    }
    if let Ok(port) = std::env::var(ENV_DB_PORT) {
        config.db.port = port
            .parse()
            .with_context(|| format!("{ENV_DB_PORT} must be a port number, got {port:?}"))?;
    }
    if let Ok(database) = std::env::var(ENV_DB_DATABASE) {
        config.db.database = database;
    }
    if let Ok(user) = std::env::var(ENV_DB_USER) {
        config.db.user = user;
    }
    if let Ok(password) = std::env::var(ENV_DB_PASSWORD) {
        config.db.password = password;
    }
    Ok(())
}

fn validate(config: &CoreConfig) -> Result<()> {
    if config.db.pool.max_pool_size == 0 {
        anyhow::bail!("db.pool.maxPoolSize must be >= 1");
    }
    if config.db.pool.minimum_idle > config.db.pool.max_pool_size {
        anyhow::bail!(
            "db.pool.minimumIdle ({}) exceeds maxPoolSize ({})",
            config.db.pool.minimum_idle,
            config.db.pool.max_pool_size
        );
    }
    if config.runtime.reconnect_every_s == 0 {
        anyhow::bail!("runtime.reconnectEveryS must be >= 1");
    }
    if !is_valid_zone_name(&config.runtime.default_zone) {
        anyhow::bail!("runtime.defaultZone is not a zone name: {:?}", config.runtime.default_zone);
    }
    Ok(())
}

/// Syntactic IANA-zone check ("UTC", "Europe/Berlin", "America/New_York").
/// Resolution against the zone database happens host-side.
pub fn is_valid_zone_name(zone: &str) -> bool {
    !zone.is_empty()
        && zone.len() <= 64
        && zone
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '-'))
        && !zone.starts_with('/')
        && !zone.ends_with('/')
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON. One config == one stable hash.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json5_accepts_comments_and_trailing_commas() {
        let loaded = load_str(
            r#"{
                // dev database
                db: { host: "db.internal", port: 3307, },
                log: { slowQueryMs: 100, },
            }"#,
        )
        .unwrap();

        assert_eq!(loaded.config.db.host, "db.internal");
        assert_eq!(loaded.config.db.port, 3307);
        assert_eq!(loaded.config.log.slow_query_ms, 100);
        // Untouched sections keep their defaults.
        assert_eq!(loaded.config.db.pool.max_pool_size, 10);
        assert!(loaded.config.modules.scheduler.enabled);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let loaded = load_str("{}").unwrap();
        assert_eq!(loaded.config.runtime.reconnect_every_s, 10);
        assert_eq!(loaded.config.modules.scheduler.jobs.backup.prune.keep_max, 30);
        assert_eq!(
            loaded.config.modules.scheduler.jobs.backup.on_missed,
            MissedFirePolicy::Skip
        );
    }

    #[test]
    fn config_hash_is_stable_across_key_order() {
        let a = load_str(r#"{ db: { host: "h", port: 3306 } }"#).unwrap();
        let b = load_str(r#"{ db: { port: 3306, host: "h" } }"#).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn default_credentials_are_detected() {
        let loaded = load_str("{}").unwrap();
        assert!(loaded.config.db.uses_default_credentials());

        let loaded = load_str(r#"{ db: { user: "prod", password: "s3cret" } }"#).unwrap();
        assert!(!loaded.config.db.uses_default_credentials());
    }

    #[test]
    fn zone_name_validation() {
        assert!(is_valid_zone_name("UTC"));
        assert!(is_valid_zone_name("Europe/Berlin"));
        assert!(is_valid_zone_name("America/New_York"));
        assert!(is_valid_zone_name("Etc/GMT+8"));
        assert!(!is_valid_zone_name(""));
        assert!(!is_valid_zone_name("/Berlin"));
        assert!(!is_valid_zone_name("bad zone"));
    }

    #[test]
    fn missed_fire_policy_parses_camel_case() {
        let loaded = load_str(
            r#"{ modules: { scheduler: { jobs: { backup: { onMissed: "runAtNextStartup" } } } } }"#,
        )
        .unwrap();
        assert_eq!(
            loaded.config.modules.scheduler.jobs.backup.on_missed,
            MissedFirePolicy::RunAtNextStartup
        );
    }
}
