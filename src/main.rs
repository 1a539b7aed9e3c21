use anyhow::{Context, Result};
use metabase::{Metabase, Migrator, SqlitePointerDb};
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting metabase with config: {:?}", cfg);

    // --- Initialize metabase ---
    ensure_parent_dir(&cfg.database_url)?;
    let metabase = Metabase::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    metabase.migrate_schema().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after schema setup
    }

    let project_id = cfg
        .project_id
        .context("a project id is required (--project-id or METABASE_PROJECT_ID)")?;
    let bucket = cfg
        .bucket
        .clone()
        .context("a bucket is required (--bucket or METABASE_BUCKET)")?;

    // --- Open legacy pointer store ---
    let pointers = SqlitePointerDb::connect(&cfg.pointerdb_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.pointerdb_url))?;

    // --- Run bucket migration ---
    let mut migrator = Migrator::new(
        Arc::new(pointers),
        metabase.aliases().clone(),
        metabase.db.clone(),
        project_id,
        bucket,
        cfg.migrator_config(),
    );
    let report = migrator.migrate_bucket().await?;

    tracing::info!(
        "Migration finished: {} objects, {} segments in {} + {} insert batches",
        report.objects,
        report.segments,
        report.object_batches.flushes,
        report.segment_batches.flushes
    );

    if !report.failures.is_empty() {
        for failure in &report.failures {
            tracing::warn!("{}", failure);
        }
        anyhow::bail!("{} objects could not be migrated", report.failures.len());
    }

    Ok(())
}

/// Create the parent directory of a file-backed SQLite URL if needed.
fn ensure_parent_dir(db_url: &str) -> Result<()> {
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if db_path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}
