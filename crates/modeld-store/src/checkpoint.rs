//! Generation-rotated snapshot store
//!
//! Each entity owns a directory under the checkpoint root:
//!
//! ```text
//! <root>/<name>/checkpoint                       pointer to the committed generation
//! <root>/<name>/checkpoint-<generation>.snap     snapshot blob (".snap.gz" when gzipped)
//! <root>/<name>/parameters.json                  creation parameters
//! <root>/<name>/model_kind                       model kind tag
//! ```
//!
//! A save writes the blob to a temp file, fsyncs and renames it, and only then
//! rewrites the pointer the same way. Readers follow the pointer, so a crash at
//! any point leaves the previous generation readable.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use modeld_core::{validate_entity_name, LockTable, ModeldError, ModeldResult, StorageConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Monotonic snapshot generation id (microseconds since the epoch)
pub type Generation = u64;

const POINTER_FILE: &str = "checkpoint";
const PARAMETERS_FILE: &str = "parameters.json";
const MODEL_KIND_FILE: &str = "model_kind";
const BLOB_PREFIX: &str = "checkpoint-";
const BLOB_SUFFIX: &str = ".snap";
const GZ_BLOB_SUFFIX: &str = ".snap.gz";
const TMP_MARKER: &str = ".tmp-";

/// How long a store operation waits for another writer of the same entity
const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Metadata of a committed snapshot, stored as the pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Entity the snapshot belongs to
    pub entity: String,
    /// Generation id
    pub generation: Generation,
    /// Whether the blob is gzipped
    pub compressed: bool,
    /// Size of the uncompressed snapshot in bytes
    pub size: u64,
    /// Commit time
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BlobFile {
    generation: Generation,
    compressed: bool,
    path: PathBuf,
}

/// Durable per-entity snapshot storage
pub struct SnapshotStore {
    /// Root directory with one subdirectory per entity
    root: PathBuf,
    /// Committed generations kept per entity
    generations: usize,
    /// Gzip new blobs
    compress: bool,
    /// Serializes writers (and readers racing pruning) per entity
    writers: LockTable,
}

impl SnapshotStore {
    /// Create a store rooted at `root`
    pub fn new(root: PathBuf, generations: usize, compress: bool) -> Self {
        Self {
            root,
            generations: generations.max(1),
            compress,
            writers: LockTable::new(),
        }
    }

    /// Create a store from the storage section of the worker config
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.checkpoint_root.clone(),
            config.generations,
            config.compress,
        )
    }

    /// Create the checkpoint root. Failure here is fatal for the worker.
    pub async fn init(&self) -> ModeldResult<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).await.map_err(|e| {
                ModeldError::Config(format!(
                    "cannot create checkpoint root {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            info!(path = %self.root.display(), "Created checkpoint root");
        }
        Ok(())
    }

    /// Checkpoint root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of generations kept per entity
    pub fn retention(&self) -> usize {
        self.generations
    }

    /// Directory holding one entity's files
    pub fn entity_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `data` as a new generation and commit it
    pub async fn save(&self, name: &str, data: Vec<u8>) -> ModeldResult<SnapshotMeta> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let dir = self.entity_dir(name);

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_failure(&dir, e))?;

        let (current, pointer_readable) = match read_pointer(&dir, name).await {
            Ok(current) => (current, true),
            Err(ModeldError::Corrupt(reason)) => {
                warn!(name = name, reason = %reason, "Replacing corrupt pointer");
                (None, false)
            }
            Err(e) => return Err(e),
        };
        let committed = current.as_ref().map(|m| m.generation).unwrap_or(0);

        let blobs = list_blobs(&dir).await?;
        let floor = blobs
            .iter()
            .map(|b| b.generation)
            .chain(std::iter::once(committed))
            .max()
            .unwrap_or(0);
        if pointer_readable {
            discard_uncommitted(&blobs, committed).await;
        }

        let generation = next_generation(floor)?;
        let size = data.len() as u64;
        let compressed = self.compress;
        let payload = if compressed {
            tokio::task::spawn_blocking(move || gzip(&data))
                .await?
                .map_err(|e| ModeldError::StoreWriteFailure(format!("compress: {}", e)))?
        } else {
            data
        };

        let blob_path = dir.join(blob_file_name(generation, compressed));
        write_atomic(&blob_path, &payload)
            .await
            .map_err(|e| write_failure(&blob_path, e))?;

        let meta = SnapshotMeta {
            entity: name.to_string(),
            generation,
            compressed,
            size,
            written_at: Utc::now(),
        };
        let pointer = serde_json::to_vec(&meta)?;
        let pointer_path = dir.join(POINTER_FILE);
        write_atomic(&pointer_path, &pointer)
            .await
            .map_err(|e| write_failure(&pointer_path, e))?;

        info!(
            name = name,
            generation = generation,
            size = size,
            compressed = compressed,
            "Snapshot committed"
        );

        if let Err(e) = self.prune(&dir, &meta).await {
            warn!(name = name, error = %e, "Failed to prune old generations");
        }

        Ok(meta)
    }

    /// Read the committed snapshot of `name`
    pub async fn load(&self, name: &str) -> ModeldResult<Vec<u8>> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let dir = self.entity_dir(name);

        let meta = read_pointer(&dir, name)
            .await?
            .ok_or_else(|| ModeldError::NotFound(name.to_string()))?;

        let path = dir.join(blob_file_name(meta.generation, meta.compressed));
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModeldError::Corrupt(format!(
                    "{}: pointer references missing generation {}",
                    name, meta.generation
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let data = if meta.compressed {
            tokio::task::spawn_blocking(move || gunzip(&raw))
                .await?
                .map_err(|e| {
                    ModeldError::Corrupt(format!(
                        "{}: generation {} does not decompress: {}",
                        name, meta.generation, e
                    ))
                })?
        } else {
            raw
        };

        debug!(name = name, generation = meta.generation, "Snapshot loaded");
        Ok(data)
    }

    /// Metadata of the committed snapshot, if any
    pub async fn latest(&self, name: &str) -> ModeldResult<Option<SnapshotMeta>> {
        validate_entity_name(name)?;
        read_pointer(&self.entity_dir(name), name).await
    }

    /// Snapshot generations present on disk, oldest first
    pub async fn generations(&self, name: &str) -> ModeldResult<Vec<Generation>> {
        validate_entity_name(name)?;
        let mut generations: Vec<Generation> = list_blobs(&self.entity_dir(name))
            .await?
            .into_iter()
            .map(|b| b.generation)
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }

    /// Delete every generation and the pointer of `name`.
    ///
    /// Parameters and the model kind are kept.
    pub async fn reset(&self, name: &str) -> ModeldResult<()> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let dir = self.entity_dir(name);

        // Pointer first: from here on readers see NotFound.
        remove_if_exists(&dir.join(POINTER_FILE)).await?;

        let mut removed = 0usize;
        for blob in list_blobs(&dir).await? {
            remove_if_exists(&blob.path).await?;
            removed += 1;
        }
        for tmp in list_temp_files(&dir).await? {
            remove_if_exists(&tmp).await?;
        }

        info!(name = name, removed = removed, "Checkpoint reset");
        Ok(())
    }

    /// Store `params` unless parameters already exist. Returns whether it wrote.
    pub async fn set_default_parameters(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> ModeldResult<bool> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let path = self.entity_dir(name).join(PARAMETERS_FILE);
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        self.write_parameters(&path, params).await?;
        debug!(name = name, "Default parameters stored");
        Ok(true)
    }

    /// Replace the parameters of `name`
    pub async fn set_parameters(&self, name: &str, params: &serde_json::Value) -> ModeldResult<()> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let path = self.entity_dir(name).join(PARAMETERS_FILE);
        self.write_parameters(&path, params).await?;
        info!(name = name, "Parameters replaced");
        Ok(())
    }

    /// Parameters of `name`, if any were stored
    pub async fn get_parameters(&self, name: &str) -> ModeldResult<Option<serde_json::Value>> {
        validate_entity_name(name)?;
        let path = self.entity_dir(name).join(PARAMETERS_FILE);
        let Some(raw) = read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| ModeldError::Corrupt(format!("{}: parameters: {}", name, e)))
    }

    /// Record the model kind of `name`
    pub async fn set_model_kind(&self, name: &str, kind: &str) -> ModeldResult<()> {
        validate_entity_name(name)?;
        let _writer = self.writers.acquire(name, WRITER_LOCK_TIMEOUT).await?;
        let dir = self.entity_dir(name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_failure(&dir, e))?;
        let path = dir.join(MODEL_KIND_FILE);
        write_atomic(&path, kind.as_bytes())
            .await
            .map_err(|e| write_failure(&path, e))
    }

    /// Recorded model kind of `name`
    pub async fn get_model_kind(&self, name: &str) -> ModeldResult<Option<String>> {
        validate_entity_name(name)?;
        let path = self.entity_dir(name).join(MODEL_KIND_FILE);
        let Some(raw) = read_optional(&path).await? else {
            return Ok(None);
        };
        let kind = String::from_utf8(raw)
            .map_err(|e| ModeldError::Corrupt(format!("{}: model kind: {}", name, e)))?;
        let kind = kind.trim();
        Ok((!kind.is_empty()).then(|| kind.to_string()))
    }

    /// Names of all entities that have a checkpoint directory
    pub async fn list_entities(&self) -> ModeldResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn write_parameters(&self, path: &Path, params: &serde_json::Value) -> ModeldResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| write_failure(dir, e))?;
        }
        let data = serde_json::to_vec_pretty(params)?;
        write_atomic(path, &data)
            .await
            .map_err(|e| write_failure(path, e))
    }

    /// Drop temp files, uncommitted blobs, and committed blobs beyond retention
    async fn prune(&self, dir: &Path, committed: &SnapshotMeta) -> ModeldResult<usize> {
        let mut removed = 0usize;

        for tmp in list_temp_files(dir).await? {
            remove_if_exists(&tmp).await?;
            removed += 1;
        }

        let mut older: Vec<BlobFile> = Vec::new();
        for blob in list_blobs(dir).await? {
            let is_committed =
                blob.generation == committed.generation && blob.compressed == committed.compressed;
            if is_committed {
                continue;
            }
            if blob.generation >= committed.generation {
                remove_if_exists(&blob.path).await?;
                removed += 1;
            } else {
                older.push(blob);
            }
        }

        older.sort_by(|a, b| b.generation.cmp(&a.generation));
        for blob in older.into_iter().skip(self.generations - 1) {
            remove_if_exists(&blob.path).await?;
            removed += 1;
        }

        if removed > 0 {
            debug!(
                name = %committed.entity,
                removed = removed,
                "Pruned old generations"
            );
        }
        Ok(removed)
    }
}

/// Strictly greater than `floor`, and the current time when that is larger
fn next_generation(floor: Generation) -> ModeldResult<Generation> {
    let next = floor.checked_add(1).ok_or_else(|| {
        ModeldError::StoreWriteFailure(format!("generation {} cannot be followed", floor))
    })?;
    let now = Utc::now().timestamp_micros().max(0) as u64;
    Ok(now.max(next))
}

fn blob_file_name(generation: Generation, compressed: bool) -> String {
    let suffix = if compressed { GZ_BLOB_SUFFIX } else { BLOB_SUFFIX };
    format!("{}{:020}{}", BLOB_PREFIX, generation, suffix)
}

fn parse_blob_name(file_name: &str) -> Option<(Generation, bool)> {
    if file_name.contains(TMP_MARKER) {
        return None;
    }
    let rest = file_name.strip_prefix(BLOB_PREFIX)?;
    let (digits, compressed) = if let Some(digits) = rest.strip_suffix(GZ_BLOB_SUFFIX) {
        (digits, true)
    } else if let Some(digits) = rest.strip_suffix(BLOB_SUFFIX) {
        (digits, false)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|generation| (generation, compressed))
}

async fn read_pointer(dir: &Path, name: &str) -> ModeldResult<Option<SnapshotMeta>> {
    let Some(raw) = read_optional(&dir.join(POINTER_FILE)).await? else {
        return Ok(None);
    };
    let meta: SnapshotMeta = serde_json::from_slice(&raw)
        .map_err(|e| ModeldError::Corrupt(format!("{}: pointer: {}", name, e)))?;
    if meta.entity != name {
        return Err(ModeldError::Corrupt(format!(
            "{}: pointer belongs to '{}'",
            name, meta.entity
        )));
    }
    Ok(Some(meta))
}

async fn read_optional(path: &Path) -> ModeldResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_blobs(dir: &Path) -> ModeldResult<Vec<BlobFile>> {
    let mut blobs = Vec::new();
    for path in list_dir(dir).await? {
        let parsed = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_blob_name);
        if let Some((generation, compressed)) = parsed {
            blobs.push(BlobFile {
                generation,
                compressed,
                path,
            });
        }
    }
    Ok(blobs)
}

async fn list_temp_files(dir: &Path) -> ModeldResult<Vec<PathBuf>> {
    Ok(list_dir(dir)
        .await?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.contains(TMP_MARKER))
        })
        .collect())
}

async fn list_dir(dir: &Path) -> ModeldResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

/// Remove blobs newer than the committed generation: leftovers of failed saves
async fn discard_uncommitted(blobs: &[BlobFile], committed: Generation) {
    for blob in blobs.iter().filter(|b| b.generation > committed) {
        match fs::remove_file(&blob.path).await {
            Ok(()) => debug!(path = %blob.path.display(), "Discarded uncommitted blob"),
            Err(e) => warn!(path = %blob.path.display(), error = %e, "Failed to discard blob"),
        }
    }
}

async fn remove_if_exists(path: &Path) -> ModeldResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write to a uniquely named temp file, fsync, then rename over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let tmp = path.with_file_name(format!(
        "{}{}{}",
        file_name,
        TMP_MARKER,
        Uuid::new_v4().simple()
    ));

    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Some(dir) = path.parent() {
        sync_dir(dir).await;
    }
    Ok(())
}

/// Persist a rename by syncing the containing directory (best effort)
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

fn write_failure(path: &Path, err: std::io::Error) -> ModeldError {
    ModeldError::StoreWriteFailure(format!("{}: {}", path.display(), err))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
