use std::io::Write;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::batch::Batch;

pub mod memory;
pub mod s3;

pub use memory::MemoryStagingStore;
pub use s3::S3StagingStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    #[error("staged object not found: {0}")]
    NotFound(String),
    #[error("staging operation failed: {0}")]
    OperationFailed(String),
    #[error("failed to serialize batch: {0}")]
    Serialization(String),
}

/// The intermediate object store the bulk loader reads staged batches from.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Write an object, returning the location URI the warehouse should be
    /// pointed at (e.g. `s3://bucket/key`).
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, StagingError>;

    async fn delete(&self, key: &str) -> Result<(), StagingError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StagingError>;
}

/// Where a load statement should point: a single staged part, or a manifest
/// listing every part when the batch spans more files than one statement
/// accepts directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedLocation {
    Single(String),
    Manifest(String),
}

impl StagedLocation {
    pub fn uri(&self) -> &str {
        match self {
            StagedLocation::Single(uri) => uri,
            StagedLocation::Manifest(uri) => uri,
        }
    }

    pub fn is_manifest(&self) -> bool {
        matches!(self, StagedLocation::Manifest(_))
    }
}

/// A batch written to the staging store: every object key written (parts and
/// manifest), plus the one location the load statement references.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub keys: Vec<String>,
    pub location: StagedLocation,
    pub part_count: usize,
}

#[derive(Serialize)]
struct ManifestEntry {
    url: String,
    mandatory: bool,
}

#[derive(Serialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

fn gzip_ndjson(rows: &[&serde_json::Map<String, serde_json::Value>]) -> Result<Vec<u8>, StagingError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for row in rows {
        let line =
            serde_json::to_vec(row).map_err(|e| StagingError::Serialization(e.to_string()))?;
        encoder
            .write_all(&line)
            .and_then(|_| encoder.write_all(b"\n"))
            .map_err(|e| StagingError::Serialization(e.to_string()))?;
    }
    encoder
        .finish()
        .map_err(|e| StagingError::Serialization(e.to_string()))
}

/// Serialize a batch to gzip'd newline-delimited JSON parts under
/// `{prefix}/{unix_ts}/{batch_id}/`. A single part is referenced directly;
/// multiple parts go behind a manifest so one load statement covers them all.
/// The timestamp path segment is what the retention sweep ages out on.
pub async fn stage_batch(
    store: &dyn StagingStore,
    prefix: &str,
    max_rows_per_part: usize,
    batch: &Batch,
) -> Result<StagedBatch, StagingError> {
    let base = format!(
        "{}/{}/{}",
        prefix.trim_end_matches('/'),
        batch.created_at.timestamp(),
        batch.id
    );

    let rows: Vec<&serde_json::Map<String, serde_json::Value>> =
        batch.items.iter().map(|item| &item.row).collect();
    let max_rows = max_rows_per_part.max(1);

    let mut keys = Vec::new();
    let mut part_locations = Vec::new();
    for (index, chunk) in rows.chunks(max_rows).enumerate() {
        let key = format!("{base}/part-{index:04}.ndjson.gz");
        let body = gzip_ndjson(chunk)?;
        let location = store.put(&key, body).await?;
        keys.push(key);
        part_locations.push(location);
    }

    let location = if part_locations.len() == 1 {
        StagedLocation::Single(part_locations.remove(0))
    } else {
        let manifest = Manifest {
            entries: part_locations
                .into_iter()
                .map(|url| ManifestEntry {
                    url,
                    mandatory: true,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| StagingError::Serialization(e.to_string()))?;
        let key = format!("{base}/manifest.json");
        let location = store.put(&key, body).await?;
        keys.push(key);
        StagedLocation::Manifest(location)
    };

    Ok(StagedBatch {
        part_count: keys.len() - usize::from(location.is_manifest()),
        keys,
        location,
    })
}

/// Best-effort delete of a staged batch. Cleanup failures are logged and
/// counted by the caller, never propagated.
pub async fn delete_staged(store: &dyn StagingStore, staged: &StagedBatch) -> usize {
    let mut failures = 0;
    for key in &staged.keys {
        if let Err(e) = store.delete(key).await {
            warn!("failed to delete staged object {key}: {e}");
            failures += 1;
        }
    }
    failures
}

/// Delete staged objects older than the retention window. Keys carry their
/// batch creation time as a path segment (after the prefix and the target
/// name), so age is decided without fetching object metadata. Returns the
/// number deleted.
pub async fn sweep_expired(
    store: &dyn StagingStore,
    prefix: &str,
    retention_secs: u64,
    now_unix: i64,
) -> Result<usize, StagingError> {
    let prefix = prefix.trim_end_matches('/');
    let keys = store.list(prefix).await?;
    let cutoff = now_unix - retention_secs as i64;

    let mut deleted = 0;
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix).map(|r| r.trim_start_matches('/')) else {
            continue;
        };
        let Some(stamp) = rest.split('/').find_map(|s| s.parse::<i64>().ok()) else {
            warn!("unexpected staged key layout, skipping: {key}");
            continue;
        };
        if stamp >= cutoff {
            continue;
        }
        match store.delete(&key).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!("failed to sweep staged object {key}: {e}"),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, FlushTrigger};
    use crate::parse::ParsedMessage;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use uuid::Uuid;

    fn batch_of(n: usize) -> Batch {
        let items = (0..n)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("seq".to_string(), serde_json::json!(i));
                ParsedMessage {
                    id: i.to_string(),
                    receipt_token: format!("token-{i}"),
                    row,
                    enqueued_at: Utc::now(),
                }
            })
            .collect();
        Batch {
            id: Uuid::now_v7(),
            items,
            created_at: Utc::now(),
            trigger: FlushTrigger::Size,
        }
    }

    fn decompress(data: &[u8]) -> String {
        let mut decoder = GzDecoder::new(data);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_small_batch_stages_single_part() {
        let store = MemoryStagingStore::new("test-staging");
        let batch = batch_of(5);

        let staged = stage_batch(&store, "loads", 100, &batch).await.unwrap();
        assert_eq!(staged.part_count, 1);
        assert_eq!(staged.keys.len(), 1);
        assert!(matches!(staged.location, StagedLocation::Single(_)));

        let body = store.get(&staged.keys[0]).unwrap();
        let ndjson = decompress(&body);
        assert_eq!(ndjson.lines().count(), 5);
        assert!(ndjson.lines().next().unwrap().contains("\"seq\":0"));
    }

    #[tokio::test]
    async fn test_large_batch_stages_manifest() {
        let store = MemoryStagingStore::new("test-staging");
        let batch = batch_of(25);

        let staged = stage_batch(&store, "loads", 10, &batch).await.unwrap();
        assert_eq!(staged.part_count, 3);
        assert_eq!(staged.keys.len(), 4); // 3 parts + manifest
        assert!(staged.location.is_manifest());

        let manifest_key = staged.keys.last().unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&store.get(manifest_key).unwrap()).unwrap();
        let entries = manifest["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e["mandatory"] == true));
    }

    #[tokio::test]
    async fn test_delete_staged_removes_all_keys() {
        let store = MemoryStagingStore::new("test-staging");
        let batch = batch_of(25);

        let staged = stage_batch(&store, "loads", 10, &batch).await.unwrap();
        let failures = delete_staged(&store, &staged).await;
        assert_eq!(failures, 0);
        assert!(store.list("loads").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired() {
        let store = MemoryStagingStore::new("test-staging");
        let now = Utc::now().timestamp();

        let mut old_batch = batch_of(2);
        old_batch.created_at = Utc::now() - chrono::Duration::seconds(1000);
        let mut fresh_batch = batch_of(2);
        fresh_batch.created_at = Utc::now();

        stage_batch(&store, "loads", 100, &old_batch).await.unwrap();
        stage_batch(&store, "loads", 100, &fresh_batch)
            .await
            .unwrap();

        let deleted = sweep_expired(&store, "loads", 900, now).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list("loads").await.unwrap().len(), 1);
    }
}
