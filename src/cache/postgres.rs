use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use tracing::debug;

use super::{CacheEntry, CacheStore};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

/// Cache backed by a PostgreSQL table, shared by every process pointing at
/// the same database.
#[derive(Clone)]
pub struct PgCache {
    pool: Arc<PgPool>,
}

impl PgCache {
    // #[instrument(name = "cache.connect")]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CacheError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgCache {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl CacheStore for PgCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        debug!(message = "Cache lookup", digest = %fingerprint.digest());
        let entry = sqlx::query_scalar::<_, Json<CacheEntry>>(
            "SELECT entry FROM render_cache \
            WHERE cache_key = $1 AND voice = $2",
        )
        .bind(fingerprint.key())
        .bind(fingerprint.voice())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry.map(|Json(entry)| entry))
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        debug!(message = "Cache store", digest = %fingerprint.digest(), job_id = %entry.job_id);
        sqlx::query(
            "INSERT INTO render_cache \
            (cache_key, voice, digest, entry) \
            VALUES ($1, $2, $3, $4) \
            ON CONFLICT (cache_key, voice) DO UPDATE \
            SET entry = EXCLUDED.entry, \
                created_at = now()",
        )
        .bind(fingerprint.key())
        .bind(fingerprint.voice())
        .bind(fingerprint.digest())
        .bind(Json(entry))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
