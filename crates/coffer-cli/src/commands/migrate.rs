use crate::services::{print_kv, Services};
use anyhow::Result;
use coffer_db::schema;

pub async fn check(services: &Services) -> Result<()> {
    let report = schema::check(&services.db).await?;
    print_kv(&[
        ("ok", "true".to_string()),
        ("current", report.is_current().to_string()),
        (
            "recorded_version",
            report.recorded_version.map_or("none".to_string(), |v| v.to_string()),
        ),
        ("runtime_version", report.runtime_version.to_string()),
        ("missing_tables", report.missing_tables.join(",")),
        ("missing_columns", report.missing_columns.join(",")),
        ("missing_indexes", report.missing_indexes.join(",")),
    ]);
    Ok(())
}

pub async fn apply(services: &Services) -> Result<()> {
    let report = schema::apply(&services.db).await?;
    print_kv(&[
        ("ok", "true".to_string()),
        ("applied", "true".to_string()),
        ("schema_version", report.runtime_version.to_string()),
        ("current", report.is_current().to_string()),
    ]);
    Ok(())
}
