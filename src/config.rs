use anyhow::{Context, Result};
use clap::Parser;
use metabase::MigratorConfig;
use std::{env, str::FromStr};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub pointerdb_url: String,
    pub project_id: Option<Uuid>,
    pub bucket: Option<String>,
    pub batch_size: usize,
    pub page_size: usize,
    pub fetch_concurrency: usize,
    pub fail_fast: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Migrate legacy pointers into the metabase")]
pub struct Args {
    /// Metabase database URL (overrides METABASE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Legacy pointer database URL (overrides METABASE_POINTERDB_URL)
    #[arg(long)]
    pub pointerdb_url: Option<String>,

    /// Project whose bucket is migrated (overrides METABASE_PROJECT_ID)
    #[arg(long)]
    pub project_id: Option<Uuid>,

    /// Bucket to migrate (overrides METABASE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Rows per insert statement (overrides METABASE_BATCH_SIZE)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Legacy keys listed per page (overrides METABASE_PAGE_SIZE)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Concurrent segment fetches per object (overrides METABASE_FETCH_CONCURRENCY)
    #[arg(long)]
    pub fetch_concurrency: Option<usize>,

    /// Stop at the first object that cannot be migrated
    #[arg(long)]
    pub fail_fast: bool,

    /// Create the metabase schema and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_db = env::var("METABASE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/metabase.db".into());
        let env_pointerdb = env::var("METABASE_POINTERDB_URL")
            .unwrap_or_else(|_| "sqlite://./data/pointerdb.db".into());
        let env_project = match env::var("METABASE_PROJECT_ID") {
            Ok(value) => Some(
                value
                    .parse::<Uuid>()
                    .with_context(|| format!("parsing METABASE_PROJECT_ID value `{}`", value))?,
            ),
            Err(_) => None,
        };
        let env_bucket = env::var("METABASE_BUCKET").ok();

        let defaults = MigratorConfig::default();
        let env_batch = env_or("METABASE_BATCH_SIZE", defaults.batch_size)?;
        let env_page = env_or("METABASE_PAGE_SIZE", defaults.page_size)?;
        let env_concurrency = env_or("METABASE_FETCH_CONCURRENCY", defaults.fetch_concurrency)?;

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            pointerdb_url: args.pointerdb_url.unwrap_or(env_pointerdb),
            project_id: args.project_id.or(env_project),
            bucket: args.bucket.or(env_bucket),
            batch_size: args.batch_size.unwrap_or(env_batch),
            page_size: args.page_size.unwrap_or(env_page),
            fetch_concurrency: args.fetch_concurrency.unwrap_or(env_concurrency),
            fail_fast: args.fail_fast,
        };

        Ok((cfg, args.migrate))
    }

    pub fn migrator_config(&self) -> MigratorConfig {
        MigratorConfig {
            batch_size: self.batch_size,
            page_size: self.page_size,
            fetch_concurrency: self.fetch_concurrency,
            fail_fast: self.fail_fast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let project = Uuid::new_v4();
        let args = Args::parse_from([
            "metabase",
            "--project-id",
            &project.to_string(),
            "--bucket",
            "photos",
            "--batch-size",
            "50",
            "--fail-fast",
        ]);
        let (cfg, migrate) = AppConfig::from_args(args).unwrap();

        assert!(!migrate);
        assert_eq!(cfg.project_id, Some(project));
        assert_eq!(cfg.bucket.as_deref(), Some("photos"));
        assert_eq!(cfg.batch_size, 50);
        let migrator = cfg.migrator_config();
        assert_eq!(migrator.batch_size, 50);
        assert!(migrator.fail_fast);
    }

    #[test]
    fn test_migrate_flag() {
        let args = Args::parse_from(["metabase", "--migrate", "--database-url", "sqlite::memory:"]);
        let (cfg, migrate) = AppConfig::from_args(args).unwrap();
        assert!(migrate);
        assert_eq!(cfg.database_url, "sqlite::memory:");
    }
}
