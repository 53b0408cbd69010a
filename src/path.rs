//! Artifact location resolution
//!
//! Local filesystem paths are normalized to absolute paths; protocol-addressed
//! paths (`hdfs://`, `s3://`, ...) are passed through unchanged.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, ShardError};

/// Canonical artifact location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Local(PathBuf),
    Remote(String),
}

impl ResolvedPath {
    pub fn is_local(&self) -> bool {
        matches!(self, ResolvedPath::Local(_))
    }

    /// Local path, or `UnsupportedLocation` for remote ones
    pub fn into_local(self) -> Result<PathBuf> {
        match self {
            ResolvedPath::Local(p) => Ok(p),
            ResolvedPath::Remote(url) => Err(ShardError::UnsupportedLocation(url)),
        }
    }
}

/// Path-resolution capability
pub trait PathResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<ResolvedPath>;
}

/// Default resolver: `file://` and bare paths are local, any other scheme is remote
#[derive(Debug, Clone, Default)]
pub struct LocalPathResolver {
    /// Base for relative paths (None = process working directory)
    base: Option<PathBuf>,
}

impl LocalPathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base` instead of the working directory
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { base: Some(base.into()) }
    }
}

impl PathResolver for LocalPathResolver {
    fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        if path.trim().is_empty() {
            return Err(ShardError::InvalidArgument("empty artifact path".into()));
        }

        let local = match split_scheme(path) {
            Some(("file", rest)) => rest,
            Some(_) => return Ok(ResolvedPath::Remote(path.to_string())),
            None => path,
        };

        let candidate = Path::new(local);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            let base = match &self.base {
                Some(base) => base.clone(),
                None => std::env::current_dir().map_err(|e| ShardError::storage(local, e))?,
            };
            base.join(candidate)
        };
        Ok(ResolvedPath::Local(normalize(&absolute)))
    }
}

/// `scheme://rest` -> `(scheme, rest)`; scheme must look like an RFC 3986 scheme
fn split_scheme(path: &str) -> Option<(&str, &str)> {
    let idx = path.find("://")?;
    let scheme = &path[..idx];
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then(|| (scheme, &path[idx + 3..]))
}

/// Lexical normalization: drop `.`, fold `..` (never above the root)
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_paths_unchanged() {
        let resolver = LocalPathResolver::new();
        let url = "hdfs://root/tmp/distributed_indices";
        assert_eq!(resolver.resolve(url).unwrap(), ResolvedPath::Remote(url.to_string()));
        assert_eq!(
            resolver.resolve("s3://bucket/a/../b").unwrap(),
            ResolvedPath::Remote("s3://bucket/a/../b".to_string())
        );
    }

    #[test]
    fn test_local_paths_made_absolute() {
        let resolver = LocalPathResolver::with_base("/data/work");
        assert_eq!(
            resolver.resolve("indices/./shards/../out").unwrap(),
            ResolvedPath::Local(PathBuf::from("/data/work/indices/out"))
        );
        assert_eq!(
            resolver.resolve("file:///var/idx").unwrap(),
            ResolvedPath::Local(PathBuf::from("/var/idx"))
        );
    }

    #[test]
    fn test_relative_without_base_uses_cwd() {
        let resolved = LocalPathResolver::new().resolve("idx").unwrap();
        match resolved {
            ResolvedPath::Local(p) => assert!(p.is_absolute()),
            other => panic!("expected local path, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_rejected_as_local() {
        let err = ResolvedPath::Remote("gs://x".into()).into_local().unwrap_err();
        assert!(matches!(err, ShardError::UnsupportedLocation(_)));
        assert!(LocalPathResolver::new().resolve("  ").is_err());
    }
}
