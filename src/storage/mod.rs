//! Artifact persistence
//!
//! One immutable blob per shard generation plus a JSON sidecar, and a
//! `CURRENT` pointer per shard directory that is switched only after the new
//! generation is fully on disk.

pub mod artifact_store;
pub mod checksum;

pub use artifact_store::{ArtifactKind, ArtifactStore, SidecarRecord, CURRENT_FILE, SIDECAR_FORMAT_VERSION};
pub use checksum::{Checksum, ChecksumError};
