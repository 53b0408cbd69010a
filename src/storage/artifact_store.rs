//! Artifact store
//!
//! ## Layout
//! ```text
//! <root>/shard_00000/index-000001.bin        blob
//! <root>/shard_00000/index-000001.meta.json  sidecar
//! <root>/shard_00000/CURRENT                 "index-000001.bin"
//! <root>/merged/merged-000001.bin
//! <root>/merged/merged-000001.meta.json
//! <root>/merged/CURRENT
//! ```
//!
//! ## Publish protocol
//! 1. Pick the next unused generation number in the directory.
//! 2. Write blob and sidecar to temp files (fsync when configured).
//! 3. Hard-link them to their final names; an existing name is never replaced.
//! 4. Switch `CURRENT` with temp file + rename.
//!
//! Readers resolve `CURRENT` first, so they either see the old generation or
//! the complete new one.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::checksum::Checksum;
use crate::config::{Compression, StorageConfig};
use crate::error::{Result, ShardError};
use crate::path::PathResolver;
use crate::types::{MergedArtifact, MergedSegment, Metric, ShardArtifact, ShardId, VectorId};

pub const CURRENT_FILE: &str = "CURRENT";
pub const SIDECAR_FORMAT_VERSION: u32 = 1;

const SHARD_PREFIX: &str = "index";
const MERGED_PREFIX: &str = "merged";
const MERGED_DIR: &str = "merged";
const BLOB_EXT: &str = "bin";
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Attempts at claiming a generation before giving up (concurrent writers)
const MAX_GENERATION_CLAIMS: u32 = 16;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Shard,
    Merged,
}

/// Metadata stored next to each blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub format_version: u32,
    pub kind: ArtifactKind,
    pub shard_id: Option<ShardId>,
    pub vector_count: usize,
    pub dimension: usize,
    pub metric: Metric,
    pub id_offset: VectorId,
    /// CRC32 of the bytes as stored (after compression)
    pub checksum: u32,
    pub stored_len: u64,
    pub compression: Compression,
    #[serde(default)]
    pub source_shard_ids: Vec<ShardId>,
    #[serde(default)]
    pub segments: Vec<MergedSegment>,
    pub created_at: u64,
}

impl SidecarRecord {
    pub fn for_shard(
        shard_id: ShardId,
        vector_count: usize,
        dimension: usize,
        metric: Metric,
        id_offset: VectorId,
    ) -> Self {
        Self {
            format_version: SIDECAR_FORMAT_VERSION,
            kind: ArtifactKind::Shard,
            shard_id: Some(shard_id),
            vector_count,
            dimension,
            metric,
            id_offset,
            checksum: 0,
            stored_len: 0,
            compression: Compression::None,
            source_shard_ids: Vec::new(),
            segments: Vec::new(),
            created_at: unix_now(),
        }
    }

    pub fn for_merged(
        vector_count: usize,
        dimension: usize,
        metric: Metric,
        segments: Vec<MergedSegment>,
    ) -> Self {
        Self {
            format_version: SIDECAR_FORMAT_VERSION,
            kind: ArtifactKind::Merged,
            shard_id: None,
            vector_count,
            dimension,
            metric,
            id_offset: 0,
            checksum: 0,
            stored_len: 0,
            compression: Compression::None,
            source_shard_ids: segments.iter().map(|s| s.shard_id).collect(),
            segments,
            created_at: unix_now(),
        }
    }

    pub fn to_shard_artifact(&self, storage_path: PathBuf) -> Result<ShardArtifact> {
        let shard_id = match (self.kind, self.shard_id) {
            (ArtifactKind::Shard, Some(id)) => id,
            _ => {
                return Err(ShardError::Corruption(format!(
                    "{} is not a shard artifact",
                    storage_path.display()
                )))
            }
        };
        Ok(ShardArtifact {
            shard_id,
            storage_path,
            vector_count: self.vector_count,
            metric: self.metric,
            dimension: self.dimension,
            id_offset: self.id_offset,
        })
    }

    pub fn to_merged_artifact(&self, storage_path: PathBuf) -> Result<MergedArtifact> {
        if self.kind != ArtifactKind::Merged {
            return Err(ShardError::Corruption(format!(
                "{} is not a merged artifact",
                storage_path.display()
            )));
        }
        Ok(MergedArtifact {
            storage_path,
            vector_count: self.vector_count,
            metric: self.metric,
            dimension: self.dimension,
            source_shard_ids: self.source_shard_ids.clone(),
            segments: self.segments.clone(),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Filesystem artifact store
#[derive(Clone)]
pub struct ArtifactStore {
    resolver: Arc<dyn PathResolver>,
    config: StorageConfig,
}

impl ArtifactStore {
    pub fn new(resolver: Arc<dyn PathResolver>, config: StorageConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolve `location` and require it to be on the local filesystem
    pub fn resolve_local(&self, location: &str) -> Result<PathBuf> {
        self.resolver.resolve(location)?.into_local()
    }

    pub fn shard_dir(root: &Path, shard_id: ShardId) -> PathBuf {
        root.join(format!("shard_{:05}", shard_id))
    }

    pub fn merged_dir(root: &Path) -> PathBuf {
        root.join(MERGED_DIR)
    }

    /// Persist a new shard generation and make it current
    pub fn publish_shard(&self, root: &Path, blob: &[u8], sidecar: SidecarRecord) -> Result<PathBuf> {
        let shard_id = sidecar.shard_id.ok_or_else(|| {
            ShardError::InvalidArgument("shard sidecar without shard_id".into())
        })?;
        self.publish(&Self::shard_dir(root, shard_id), SHARD_PREFIX, blob, sidecar)
    }

    /// Persist a new merged generation and make it current
    pub fn publish_merged(&self, root: &Path, blob: &[u8], sidecar: SidecarRecord) -> Result<PathBuf> {
        self.publish(&Self::merged_dir(root), MERGED_PREFIX, blob, sidecar)
    }

    fn publish(&self, dir: &Path, prefix: &str, blob: &[u8], mut sidecar: SidecarRecord) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| ShardError::storage(dir, e))?;

        let stored = match self.config.compression {
            Compression::None => blob.to_vec(),
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(blob)
                .map_err(|e| ShardError::Serialization(format!("snappy: {}", e)))?,
        };
        sidecar.checksum = Checksum::compute(&stored);
        sidecar.stored_len = stored.len() as u64;
        sidecar.compression = self.config.compression;
        let sidecar_bytes = serde_json::to_vec_pretty(&sidecar)?;

        let blob_tmp = self.write_temp(dir, &stored)?;
        let sidecar_tmp = match self.write_temp(dir, &sidecar_bytes) {
            Ok(p) => p,
            Err(e) => {
                let _ = fs::remove_file(&blob_tmp);
                return Err(e);
            }
        };

        let claimed = self.claim_generation(dir, prefix, &blob_tmp, &sidecar_tmp);
        let _ = fs::remove_file(&blob_tmp);
        let _ = fs::remove_file(&sidecar_tmp);
        let blob_path = claimed?;

        let file_name = blob_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.switch_current(dir, &file_name)?;

        debug!(path = %blob_path.display(), bytes = stored.len(), "artifact published");
        Ok(blob_path)
    }

    /// Link temp files to the first free generation; never replaces an existing name
    fn claim_generation(&self, dir: &Path, prefix: &str, blob_tmp: &Path, sidecar_tmp: &Path) -> Result<PathBuf> {
        for _ in 0..MAX_GENERATION_CLAIMS {
            let generation = Self::latest_generation(dir, prefix)? + 1;
            let blob_path = dir.join(format!("{}-{:06}.{}", prefix, generation, BLOB_EXT));
            let sidecar_path = Self::sidecar_path(&blob_path);

            // 先放 sidecar，再放 blob：generation 以 blob 为准
            match fs::hard_link(sidecar_tmp, &sidecar_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ShardError::storage(&sidecar_path, e)),
            }
            match fs::hard_link(blob_tmp, &blob_path) {
                Ok(()) => {
                    self.sync_dir(dir)?;
                    return Ok(blob_path);
                }
                Err(e) => {
                    let _ = fs::remove_file(&sidecar_path);
                    if e.kind() == ErrorKind::AlreadyExists {
                        continue;
                    }
                    return Err(ShardError::storage(&blob_path, e));
                }
            }
        }
        Err(ShardError::storage(
            dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "could not claim a new generation"),
        ))
    }

    fn write_temp(&self, dir: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(".tmp-{}-{}", std::process::id(), n));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ShardError::storage(&path, e))?;
        file.write_all(bytes).map_err(|e| ShardError::storage(&path, e))?;
        if self.config.fsync {
            file.sync_all().map_err(|e| ShardError::storage(&path, e))?;
        }
        Ok(path)
    }

    fn switch_current(&self, dir: &Path, file_name: &str) -> Result<()> {
        let tmp = self.write_temp(dir, format!("{}\n", file_name).as_bytes())?;
        let current = dir.join(CURRENT_FILE);
        if let Err(e) = fs::rename(&tmp, &current) {
            let _ = fs::remove_file(&tmp);
            return Err(ShardError::storage(&current, e));
        }
        self.sync_dir(dir)
    }

    fn sync_dir(&self, dir: &Path) -> Result<()> {
        if !self.config.fsync {
            return Ok(());
        }
        #[cfg(unix)]
        {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| ShardError::storage(dir, e))?;
        }
        Ok(())
    }

    fn latest_generation(dir: &Path, prefix: &str) -> Result<u64> {
        let entries = fs::read_dir(dir).map_err(|e| ShardError::storage(dir, e))?;
        let head = format!("{}-", prefix);
        let tail = format!(".{}", BLOB_EXT);

        let mut latest = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ShardError::storage(dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // a sidecar left behind by an interrupted claim also burns its generation
            let generation = name
                .strip_prefix(head.as_str())
                .and_then(|rest| {
                    rest.strip_suffix(tail.as_str())
                        .or_else(|| rest.strip_suffix(SIDECAR_SUFFIX))
                })
                .and_then(|num| num.parse::<u64>().ok());
            if let Some(g) = generation {
                latest = latest.max(g);
            }
        }
        Ok(latest)
    }

    pub fn sidecar_path(blob_path: &Path) -> PathBuf {
        let mut name = blob_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        name.push(SIDECAR_SUFFIX);
        blob_path.with_file_name(name)
    }

    pub fn read_sidecar(&self, blob_path: &Path) -> Result<SidecarRecord> {
        let blob_path = self.resolve_local(&blob_path.to_string_lossy())?;
        let path = Self::sidecar_path(&blob_path);
        let bytes = fs::read(&path).map_err(|e| ShardError::storage(&path, e))?;
        let record: SidecarRecord = serde_json::from_slice(&bytes)?;
        if record.format_version != SIDECAR_FORMAT_VERSION {
            return Err(ShardError::Corruption(format!(
                "{}: unsupported sidecar version {}",
                path.display(),
                record.format_version
            )));
        }
        Ok(record)
    }

    /// Read and verify a blob, returning the engine bytes (decompressed)
    pub fn read_blob(&self, blob_path: &Path) -> Result<Vec<u8>> {
        let sidecar = self.read_sidecar(blob_path)?;
        let path = self.resolve_local(&blob_path.to_string_lossy())?;
        let stored = fs::read(&path).map_err(|e| ShardError::storage(&path, e))?;

        if stored.len() as u64 != sidecar.stored_len {
            return Err(ShardError::Corruption(format!(
                "{}: expected {} bytes, found {}",
                path.display(),
                sidecar.stored_len,
                stored.len()
            )));
        }
        Checksum::verify(&stored, sidecar.checksum)
            .map_err(|e| ShardError::Corruption(format!("{}: {}", path.display(), e)))?;

        match sidecar.compression {
            Compression::None => Ok(stored),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(&stored)
                .map_err(|e| ShardError::Corruption(format!("{}: snappy: {}", path.display(), e))),
        }
    }

    /// Blob path named by `dir/CURRENT`, if any
    pub fn current(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let pointer = dir.join(CURRENT_FILE);
        match fs::read_to_string(&pointer) {
            Ok(name) => {
                let name = name.trim();
                if name.is_empty() || name.contains(['/', '\\']) {
                    return Err(ShardError::Corruption(format!(
                        "{}: bad pointer '{}'",
                        pointer.display(),
                        name
                    )));
                }
                Ok(Some(dir.join(name)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ShardError::storage(&pointer, e)),
        }
    }

    pub fn load_shard_artifact(&self, blob_path: &Path) -> Result<ShardArtifact> {
        self.read_sidecar(blob_path)?.to_shard_artifact(blob_path.to_path_buf())
    }

    /// Current artifact of every shard directory under `root`, ordered by shard id
    pub fn list_current_shards(&self, root: &str) -> Result<Vec<ShardArtifact>> {
        let root = self.resolve_local(root)?;
        let entries = fs::read_dir(&root).map_err(|e| ShardError::storage(&root, e))?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ShardError::storage(&root, e))?;
            let name = entry.file_name();
            let is_shard_dir = name
                .to_str()
                .and_then(|n| n.strip_prefix("shard_"))
                .map(|n| n.parse::<ShardId>().is_ok())
                .unwrap_or(false);
            if !is_shard_dir {
                continue;
            }
            match self.current(&entry.path())? {
                Some(blob) => artifacts.push(self.load_shard_artifact(&blob)?),
                None => warn!(dir = %entry.path().display(), "shard directory without CURRENT, skipped"),
            }
        }
        artifacts.sort_by_key(|a| a.shard_id);
        Ok(artifacts)
    }

    /// Current merged artifact under `root`, if one was published
    pub fn current_merged(&self, root: &str) -> Result<Option<MergedArtifact>> {
        let root = self.resolve_local(root)?;
        match self.current(&Self::merged_dir(&root))? {
            Some(blob) => Ok(Some(self.read_sidecar(&blob)?.to_merged_artifact(blob)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::LocalPathResolver;
    use tempfile::tempdir;

    fn store(compression: Compression) -> ArtifactStore {
        ArtifactStore::new(
            Arc::new(LocalPathResolver::new()),
            StorageConfig { compression, fsync: false },
        )
    }

    #[test]
    fn test_publish_and_read_back() {
        let dir = tempdir().unwrap();
        let store = store(Compression::None);
        let sidecar = SidecarRecord::for_shard(3, 2, 4, Metric::L2, 100);

        let path = store.publish_shard(dir.path(), b"blob-one", sidecar).unwrap();
        assert!(path.ends_with("shard_00003/index-000001.bin"));
        assert_eq!(store.read_blob(&path).unwrap(), b"blob-one");

        let artifact = store.load_shard_artifact(&path).unwrap();
        assert_eq!(artifact.shard_id, 3);
        assert_eq!(artifact.id_offset, 100);
        assert_eq!(artifact.dimension, 4);
    }

    #[test]
    fn test_new_generation_never_overwrites() {
        let dir = tempdir().unwrap();
        let store = store(Compression::None);

        let first = store
            .publish_shard(dir.path(), b"old", SidecarRecord::for_shard(0, 1, 1, Metric::L2, 0))
            .unwrap();
        let second = store
            .publish_shard(dir.path(), b"new", SidecarRecord::for_shard(0, 1, 1, Metric::L2, 0))
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(store.read_blob(&first).unwrap(), b"old");
        assert_eq!(store.read_blob(&second).unwrap(), b"new");

        let shard_dir = ArtifactStore::shard_dir(dir.path(), 0);
        assert_eq!(store.current(&shard_dir).unwrap(), Some(second));
    }

    #[test]
    fn test_snappy_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(Compression::Snappy);
        let blob = vec![7u8; 4096];
        let path = store
            .publish_shard(dir.path(), &blob, SidecarRecord::for_shard(1, 1, 1, Metric::Cosine, 0))
            .unwrap();

        let sidecar = store.read_sidecar(&path).unwrap();
        assert_eq!(sidecar.compression, Compression::Snappy);
        assert!(sidecar.stored_len < blob.len() as u64);
        assert_eq!(store.read_blob(&path).unwrap(), blob);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let store = store(Compression::None);
        let path = store
            .publish_shard(dir.path(), b"payload!", SidecarRecord::for_shard(0, 1, 1, Metric::L2, 0))
            .unwrap();

        fs::write(&path, b"payload?").unwrap();
        assert!(matches!(store.read_blob(&path), Err(ShardError::Corruption(_))));

        fs::write(&path, b"pay").unwrap();
        assert!(matches!(store.read_blob(&path), Err(ShardError::Corruption(_))));
    }

    #[test]
    fn test_list_current_shards() {
        let dir = tempdir().unwrap();
        let store = store(Compression::None);
        for id in [2u32, 0, 1] {
            store
                .publish_shard(dir.path(), b"x", SidecarRecord::for_shard(id, 1, 1, Metric::L2, id as u64))
                .unwrap();
        }
        fs::create_dir_all(dir.path().join("shard_00009")).unwrap(); // no CURRENT yet
        fs::create_dir_all(dir.path().join("scratch")).unwrap();

        let root = dir.path().to_string_lossy().into_owned();
        let listed = store.list_current_shards(&root).unwrap();
        assert_eq!(listed.iter().map(|a| a.shard_id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(store.current_merged(&root).unwrap().is_none());
    }

    #[test]
    fn test_missing_blob_is_retryable_storage_error() {
        let store = store(Compression::None);
        let err = store.read_blob(Path::new("/nonexistent/shard_00000/index-000001.bin")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_remote_location_unsupported() {
        let store = store(Compression::None);
        assert!(matches!(
            store.resolve_local("hdfs://root/tmp/indices"),
            Err(ShardError::UnsupportedLocation(_))
        ));
    }
}
