//! Completed-result cache.
//!
//! The pipeline reads once before any generation and writes once after a
//! successful join. Both directions are skipped for image-bearing jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::JobId;

mod memory;
mod postgres;

pub use memory::MemoryCache;
pub use postgres::PgCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub job_id: JobId,
    pub final_artifact: PathBuf,
    pub final_url: Option<String>,
    pub num_sections: usize,
    pub metadata: CacheMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub prompt: String,
    pub file_size_mb: f64,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Overwrites any existing entry for the fingerprint.
    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError>;
}
