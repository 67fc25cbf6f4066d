use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use crate::config::DbConfig;
use crate::util::env::{db_url, env_flag, env_opt};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to the postgres db")?;
        info!(max_connections, "connected to db");

        let db = Self { pool };
        // Off by default: production schemas are migrated deliberately via `vinylctl migrate`.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Connect using `DATABASE_URL` (or its parts) and `DB_MAX_CONNS`, then wait
    /// up to 30s for the server to answer.
    pub async fn connect_from_env() -> Result<Self> {
        let url = db_url()?;
        let cfg = DbConfig::from_env();
        let db = Self::connect(&url, cfg.max_connections).await?;
        db.wait_until_up(Duration::from_secs(30)).await?;
        Ok(db)
    }

    /// Poll `SELECT 1` once a second until the database answers or `timeout` lapses.
    pub async fn wait_until_up(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match sqlx::query("SELECT 1").execute(&self.pool).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() < deadline => {
                    warn!(error = %e, "database not ready; retrying");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("database still down after {}s", timeout.as_secs())))
                }
            }
        }
    }

    /// Apply `migrations/NNNN_name.sql` files not yet recorded in `_vinyl_migrations`.
    /// Files without a numeric prefix are ignored. Each file runs in its own transaction.
    pub async fn run_migrations(&self) -> Result<Vec<i64>> {
        let dir = env_opt("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./migrations"));
        if !dir.exists() {
            warn!(dir = %dir.display(), "migrations directory not found; skipping");
            return Ok(vec![]);
        }

        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _vinyl_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for r in sqlx::query("SELECT version FROM _vinyl_migrations")
            .fetch_all(&self.pool)
            .await?
        {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut newly_applied = Vec::new();
        for (version, desc, path) in migration_files(&dir)? {
            if applied.contains(&version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read migration {}", path.display()))?;
            info!(version, file = ?path, "applying migration");

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(&sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version} failed"))?;
            sqlx::query("INSERT INTO _vinyl_migrations (version, description) VALUES ($1, $2)")
                .bind(version)
                .bind(&desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            applied.insert(version);
            newly_applied.push(version);
        }
        info!(applied = newly_applied.len(), "migrations up-to-date");
        Ok(newly_applied)
    }
}

/// Numbered `.sql` files in `dir`, ordered by version.
fn migration_files(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            candidates.push((version, desc, path));
        }
    }
    candidates.sort_by_key(|(v, _, _)| *v);
    Ok(candidates)
}

fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = stem[digits.len()..].strip_prefix('_')?;
    Some((digits.parse().ok()?, rest.to_string()))
}
