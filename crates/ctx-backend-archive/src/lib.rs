// SPDX-License-Identifier: MIT OR Apache-2.0
//! The durable, file-per-record archive backend (C5, spec §4.6): the cold
//! tier for large or aged-out records, with an optional pre-compressed
//! variant probed across the closed algorithm set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctx_backend_core::{
    check_query_capability, Backend, BackendIdentity, PartialUpdate, Query, QueryCapability,
};
use ctx_core::{Algorithm, CompressedContext, ContextMetadata, ContextRecord, Service, StorageLocation};
use ctx_error::{CtxError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sidecar persisted alongside a compressed or archived payload, carrying
/// everything about [`CompressedContext`] except the opaque bytes (those
/// live in the sibling `compressed/`/`archives/` file).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveSidecar {
    context_id: String,
    algorithm: Algorithm,
    stats: ctx_core::CompressionStats,
    preserved_metadata: ContextMetadata,
    checksum: String,
    verified: bool,
}

impl ArchiveSidecar {
    fn from_compressed(compressed: &CompressedContext) -> Self {
        ArchiveSidecar {
            context_id: compressed.context_id.clone(),
            algorithm: compressed.algorithm,
            stats: compressed.stats,
            preserved_metadata: compressed.preserved_metadata.clone(),
            checksum: compressed.checksum.clone(),
            verified: compressed.verified,
        }
    }

    fn into_compressed(self, data: Vec<u8>) -> CompressedContext {
        CompressedContext {
            context_id: self.context_id,
            algorithm: self.algorithm,
            data,
            stats: self.stats,
            preserved_metadata: self.preserved_metadata,
            checksum: self.checksum,
            verified: self.verified,
        }
    }
}

/// A file-per-record archive rooted at a configured base path (spec §4.6's
/// `contexts/`, `compressed/`, `archives/`, `metadata/`, `backups/` layout).
#[derive(Debug, Clone)]
pub struct ArchiveBackend {
    root: PathBuf,
    default_algorithm: Algorithm,
}

fn io_error(what: &str, err: std::io::Error) -> CtxError {
    CtxError::new(
        ErrorCode::BackendUnavailableTransport,
        format!("{what}: {err}"),
    )
    .with_source(err)
}

/// Runs a blocking filesystem closure on the blocking pool, collapsing both
/// the `JoinError` (task panicked) and the closure's own `io::Error` into a
/// single [`CtxError`] in the `BackendUnavailable` category.
async fn run_blocking<T, F>(what: &str, f: F) -> Result<T, CtxError>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(io_error(what, e)),
        Err(e) => Err(CtxError::new(
            ErrorCode::BackendUnavailableTransport,
            format!("{what}: blocking task panicked: {e}"),
        )),
    }
}

impl ArchiveBackend {
    /// Builds a backend rooted at `base_path`. Performs no I/O; call
    /// [`ArchiveBackend::ensure_dirs`] before first use.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>, default_algorithm: Algorithm) -> Self {
        ArchiveBackend {
            root: base_path.into(),
            default_algorithm,
        }
    }

    fn contexts_dir(&self) -> PathBuf {
        self.root.join("contexts")
    }

    fn compressed_dir(&self) -> PathBuf {
        self.root.join("compressed")
    }

    fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    fn context_path(&self, id: &str) -> PathBuf {
        self.contexts_dir().join(format!("{id}.json"))
    }

    fn compressed_path(&self, id: &str, algorithm: Algorithm) -> PathBuf {
        self.compressed_dir()
            .join(format!("{id}.{}", algorithm.extension()))
    }

    fn archive_path(&self, id: &str, algorithm: Algorithm) -> PathBuf {
        self.archives_dir()
            .join(format!("{id}.{}", algorithm.extension()))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{id}.json"))
    }

    /// Creates the five top-level directories of the layout, idempotently.
    pub async fn ensure_dirs(&self) -> Result<(), CtxError> {
        let dirs = vec![
            self.contexts_dir(),
            self.compressed_dir(),
            self.archives_dir(),
            self.metadata_dir(),
            self.backups_dir(),
        ];
        run_blocking("ensure archive directories", move || {
            for dir in dirs {
                std::fs::create_dir_all(&dir)?;
            }
            Ok(())
        })
        .await
    }

    /// Stores a pre-compressed record under `compressed/` plus its sidecar
    /// under `metadata/` (spec §4.6 `storeCompressed`).
    pub async fn store_compressed(&self, compressed: &CompressedContext) -> Result<(), CtxError> {
        let path = self.compressed_path(&compressed.context_id, compressed.algorithm);
        let sidecar_path = self.metadata_path(&compressed.context_id);
        let data = compressed.data.clone();
        let sidecar = ArchiveSidecar::from_compressed(compressed);
        let sidecar_json = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;

        run_blocking("store compressed context", move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &data)?;
            if let Some(parent) = sidecar_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&sidecar_path, sidecar_json)?;
            Ok(())
        })
        .await
    }

    /// Probes `compressed/<id>.*` across the closed algorithm set and
    /// returns the first hit whose digest verifies (spec §4.6
    /// `retrieveCompressed`). `Ok(None)` means no variant exists at all; a
    /// variant that exists but fails digest verification is an error.
    pub async fn retrieve_compressed(&self, id: &str) -> Result<Option<CompressedContext>, CtxError> {
        for algorithm in Algorithm::ALL {
            let path = self.compressed_path(id, algorithm);
            let sidecar_path = self.metadata_path(id);
            let path_clone = path.clone();
            let sidecar_path_clone = sidecar_path.clone();
            let read: Option<(Vec<u8>, String)> = run_blocking("probe compressed context", move || {
                if !path_clone.exists() {
                    return Ok(None);
                }
                let data = std::fs::read(&path_clone)?;
                let sidecar_json = std::fs::read_to_string(&sidecar_path_clone)?;
                Ok(Some((data, sidecar_json)))
            })
            .await?;

            let Some((data, sidecar_json)) = read else {
                continue;
            };
            let sidecar: ArchiveSidecar = serde_json::from_str(&sidecar_json).map_err(|e| {
                CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string())
            })?;
            let mut compressed = sidecar.into_compressed(data);
            match ctx_codec::decompress_verified(&compressed) {
                Ok(_) => {
                    compressed.verified = true;
                    return Ok(Some(compressed));
                }
                Err(e) => {
                    return Err(CtxError::new(
                        ErrorCode::ChecksumMismatchDigest,
                        format!("compressed variant {algorithm} failed digest verification: {e}"),
                    ));
                }
            }
        }
        Ok(None)
    }

    /// Walks `contexts/`, compressing and relocating every record whose file
    /// mtime is older than `older_than_days` into `archives/`. The original
    /// is deleted only after the archived copy is durably written (spec
    /// §4.6 "archival sweep"). Returns the number of records archived.
    pub async fn archive_old_contexts(&self, older_than_days: i64) -> Result<usize, CtxError> {
        let contexts_dir = self.contexts_dir();
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let entries: Vec<(String, PathBuf)> = run_blocking("scan contexts for archival", move || {
            let mut out = Vec::new();
            let read_dir = match std::fs::read_dir(&contexts_dir) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
                Err(e) => return Err(e),
            };
            for entry in read_dir {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
                if modified < cutoff {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        out.push((stem.to_string(), path));
                    }
                }
            }
            Ok(out)
        })
        .await?;

        let mut archived = 0usize;
        for (id, path) in entries {
            let record = match self.read_context_file(&path).await {
                Ok(Some(record)) => record,
                _ => continue,
            };
            let plain = serde_json::to_vec(&record.content)
                .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;
            let compressed = ctx_codec::compress_context(
                record.id.clone(),
                &plain,
                self.default_algorithm,
                record.metadata.clone(),
            )
            .map_err(|e| io_error("compress record for archival", std::io::Error::other(e)))?;

            let archive_path = self.archive_path(&id, self.default_algorithm);
            let sidecar_path = self.metadata_path(&id);
            let sidecar = ArchiveSidecar::from_compressed(&compressed);
            let sidecar_json = serde_json::to_string_pretty(&sidecar)
                .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;
            let data = compressed.data.clone();

            let write_ok: Result<(), CtxError> = run_blocking("write archived record", move || {
                if let Some(parent) = archive_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&archive_path, &data)?;
                if let Some(parent) = sidecar_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&sidecar_path, sidecar_json)?;
                Ok(())
            })
            .await;

            match write_ok {
                Ok(()) => {
                    let context_path = path.clone();
                    let removed: Result<(), CtxError> =
                        run_blocking("delete archived original", move || {
                            std::fs::remove_file(&context_path)
                        })
                        .await;
                    if removed.is_ok() {
                        archived += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "archival write failed, leaving original copy in place");
                }
            }
        }
        Ok(archived)
    }

    async fn read_context_file(&self, path: &Path) -> Result<Option<ContextRecord>, CtxError> {
        let path = path.to_path_buf();
        run_blocking("read context file", move || {
            if !path.exists() {
                return Ok(None);
            }
            let json = std::fs::read_to_string(&path)?;
            let record: ContextRecord = serde_json::from_str(&json).map_err(std::io::Error::other)?;
            Ok(Some(record))
        })
        .await
    }

    async fn write_context_file(&self, record: &ContextRecord) -> Result<(), CtxError> {
        let path = self.context_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;
        run_blocking("write context file", move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, json)
        })
        .await
    }
}

#[async_trait]
impl Backend for ArchiveBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            service: Service::Archive,
        }
    }

    fn query_capability(&self) -> QueryCapability {
        QueryCapability::IdOnly
    }

    async fn store(&self, record: &ContextRecord) -> Result<StorageLocation, CtxError> {
        self.write_context_file(record).await?;
        let size = serde_json::to_vec(record)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        Ok(StorageLocation {
            context_id: record.id.clone(),
            service: Service::Archive,
            path: self.context_path(&record.id).to_string_lossy().into_owned(),
            stored_at: Utc::now(),
            storage_size: size,
            compressed: false,
            encrypted: record.metadata.mcp_storage.encrypted,
            access_count: record.metadata.access_count,
        })
    }

    async fn retrieve(&self, id: &str) -> Result<Option<ContextRecord>, CtxError> {
        let path = self.context_path(id);
        let Some(mut record) = self.read_context_file(&path).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        if record.metadata.is_expired(now) {
            self.delete(&record.id).await?;
            return Ok(None);
        }
        record.metadata.record_access(now);
        self.write_context_file(&record).await?;
        Ok(Some(record))
    }

    async fn update(&self, id: &str, partial: &PartialUpdate) -> Result<bool, CtxError> {
        let path = self.context_path(id);
        let Some(mut record) = self.read_context_file(&path).await? else {
            return Ok(false);
        };

        if let Some(content) = partial.content.clone() {
            record.content = content;
        }
        if let Some(priority) = partial.priority {
            record.metadata.priority = priority;
        }
        if let Some(score) = partial.relevance_score {
            record.metadata.relevance_score = score;
        }
        if let Some(archived) = partial.archived {
            record.metadata.archived = archived;
        }
        if let Some(owner) = partial.owner.clone() {
            record.metadata.owner = Some(owner);
        }
        if let Some(tags) = partial.tags.clone() {
            record.metadata.tags = tags;
        }
        if let Some(ttl) = partial.ttl {
            record.metadata.ttl = Some(ttl);
            record.metadata.expires_at =
                Some(record.metadata.created_at + chrono::Duration::seconds(ttl as i64));
        }

        let now = Utc::now();
        record.bump_version(now);
        record.checksum = ctx_core::content_checksum(&record.content)
            .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;

        if let Err(errors) = ctx_validate::validate(&record) {
            let first = errors.first().map(|e| e.to_string()).unwrap_or_default();
            return Err(CtxError::new(
                ErrorCode::ValidationInvariantViolation,
                "updated record failed validation",
            )
            .with_context("first_issue", serde_json::json!(first)));
        }

        self.write_context_file(&record).await?;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<(), CtxError> {
        let context_path = self.context_path(id);
        let metadata_path = self.metadata_path(id);
        let compressed_paths: Vec<PathBuf> = Algorithm::ALL
            .into_iter()
            .map(|a| self.compressed_path(id, a))
            .collect();
        run_blocking("delete archived record", move || {
            let _ = std::fs::remove_file(&context_path);
            let _ = std::fs::remove_file(&metadata_path);
            for path in compressed_paths {
                let _ = std::fs::remove_file(&path);
            }
            Ok(())
        })
        .await
    }

    async fn query(&self, query: &Query) -> Result<Vec<ContextRecord>, CtxError> {
        check_query_capability(self.query_capability(), query)?;

        let contexts_dir = self.contexts_dir();
        let paths: Vec<PathBuf> = run_blocking("list archived contexts", move || {
            let read_dir = match std::fs::read_dir(&contexts_dir) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut out = Vec::new();
            for entry in read_dir {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    out.push(path);
                }
            }
            Ok(out)
        })
        .await?;

        let now = Utc::now();
        let mut records = Vec::new();
        for path in paths {
            if let Some(record) = self.read_context_file(&path).await? {
                if !record.metadata.is_expired(now) {
                    records.push(record);
                }
            }
        }

        if let Some(offset) = query.offset {
            records = records.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn health_check(&self) -> bool {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::metadata(&root).is_ok_and(|meta| meta.is_dir())
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctx_core::{ContextContent, ContextMetadata, ContextRecordBuilder, KnowledgeContent};

    fn sample(id: &str) -> ContextRecord {
        let now = Utc::now();
        let content = ContextContent::Knowledge(KnowledgeContent {
            topic: "rust".to_string(),
            body: "ownership explained in depth".to_string(),
            sources: vec![],
        });
        let metadata = ContextMetadata::new(now, 5, None);
        ContextRecordBuilder::new(id.to_string(), content, metadata)
            .build()
            .expect("builds")
    }

    async fn backend() -> (ArchiveBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = ArchiveBackend::new(dir.path(), Algorithm::Zstd);
        backend.ensure_dirs().await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let (backend, _dir) = backend().await;
        let record = sample("a");
        backend.store(&record).await.unwrap();
        let fetched = backend.retrieve("a").await.unwrap().unwrap();
        assert_eq!(fetched.id, "a");
        assert_eq!(fetched.metadata.access_count, 1);
    }

    #[tokio::test]
    async fn retrieve_missing_is_none() {
        let (backend, _dir) = backend().await;
        assert!(backend.retrieve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_missing_files_are_not_errors() {
        let (backend, _dir) = backend().await;
        backend.store(&sample("a")).await.unwrap();
        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        assert!(backend.retrieve("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let (backend, _dir) = backend().await;
        backend.store(&sample("a")).await.unwrap();
        let patch = PartialUpdate {
            priority: Some(3),
            ..Default::default()
        };
        assert!(backend.update("a", &patch).await.unwrap());
        let fetched = backend.retrieve("a").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.priority, 3);
        assert_eq!(fetched.version, 2);
    }

    #[tokio::test]
    async fn store_compressed_then_retrieve_compressed_round_trips() {
        let (backend, _dir) = backend().await;
        let record = sample("a");
        let plain = serde_json::to_vec(&record.content).unwrap();
        let compressed =
            ctx_codec::compress_context("a", &plain, Algorithm::Zstd, record.metadata.clone())
                .unwrap();
        backend.store_compressed(&compressed).await.unwrap();

        let fetched = backend.retrieve_compressed("a").await.unwrap().unwrap();
        assert_eq!(fetched.algorithm, Algorithm::Zstd);
        assert!(fetched.verified);
        let decompressed = ctx_codec::decompress_verified(&fetched).unwrap();
        assert_eq!(decompressed, plain);
    }

    #[tokio::test]
    async fn retrieve_compressed_missing_is_none() {
        let (backend, _dir) = backend().await;
        assert!(backend.retrieve_compressed("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_old_contexts_moves_aged_records() {
        let (backend, _dir) = backend().await;
        backend.store(&sample("a")).await.unwrap();
        // mtime is "now" so nothing is older than a negative cutoff's complement;
        // use a 0-day cutoff with a manually backdated file instead.
        let path = backend.context_path("a");
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600 * 24 * 10);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(past).unwrap();

        let archived = backend.archive_old_contexts(5).await.unwrap();
        assert_eq!(archived, 1);
        assert!(backend.retrieve("a").await.unwrap().is_none());
        assert!(backend.archive_path("a", Algorithm::Zstd).exists());
    }

    #[tokio::test]
    async fn health_check_is_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("never-created");
        let backend = ArchiveBackend::new(&root, Algorithm::Zstd);
        assert!(!backend.health_check().await);
        assert!(!root.exists(), "a probe must not create the directory it checks");
    }

    #[tokio::test]
    async fn health_check_succeeds_once_dirs_exist() {
        let (backend, _dir) = backend().await;
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn query_without_predicates_lists_all() {
        let (backend, _dir) = backend().await;
        backend.store(&sample("a")).await.unwrap();
        backend.store(&sample("b")).await.unwrap();
        let results = backend.query(&Query::new()).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn query_with_predicate_is_unsupported() {
        use ctx_backend_core::QueryPredicate;
        let (backend, _dir) = backend().await;
        let query = Query {
            predicates: vec![QueryPredicate::Equals {
                field: "metadata.owner".to_string(),
                value: serde_json::json!("bob"),
            }],
            ..Query::new()
        };
        assert!(backend.query(&query).await.is_err());
    }
}
