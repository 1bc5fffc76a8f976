use crate::services::{print_kv, Services};
use anyhow::{Context, Result};
use coffer_db::schema;

pub async fn ping(services: &Services) -> Result<()> {
    let started = std::time::Instant::now();
    let one: i32 = sqlx::query_scalar("SELECT 1")
        .fetch_one(services.db.pool())
        .await
        .context("ping query")?;
    print_kv(&[
        ("ok", (one == 1).to_string()),
        ("latency_ms", started.elapsed().as_millis().to_string()),
        ("health", services.db.health().status().as_str().to_string()),
    ]);
    Ok(())
}

pub async fn info(services: &Services) -> Result<()> {
    let version: String = sqlx::query_scalar("SELECT VERSION()")
        .fetch_one(services.db.pool())
        .await
        .context("server version query")?;
    let schema_version = schema::recorded_version(&services.db).await?;
    let metrics = services.db.metrics().snapshot();

    print_kv(&[
        ("ok", "true".to_string()),
        ("server_version", version),
        (
            "schema_version",
            schema_version.map_or("none".to_string(), |v| v.to_string()),
        ),
        ("runtime_schema_version", schema::SCHEMA_VERSION.to_string()),
        ("health", services.db.health().status().as_str().to_string()),
        ("pool_size", services.db.pool().size().to_string()),
        ("pool_idle", services.db.pool().num_idle().to_string()),
        (
            "config_hash",
            services.loaded.config_hash.chars().take(12).collect(),
        ),
        (
            "metrics",
            serde_json::to_string(&metrics).unwrap_or_default(),
        ),
    ]);
    Ok(())
}
