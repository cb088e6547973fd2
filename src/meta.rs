use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::Layout;
use crate::site::MetaObject;
use crate::tree::{write_file, ContentFile, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("failed to read metadata at {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid metadata at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to persist metadata: {0}")]
    Write(#[from] WriteError),
    #[error("failed to move metadata into place at {path}: {source}")]
    Rename { path: PathBuf, source: io::Error },
}

/// Result of comparing a fresh payload digest with the persisted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// No metadata has been persisted yet.
    Missing,
    /// Metadata exists but could not be read or parsed.
    Unreadable(String),
    /// Digests differ; the previous record was archived under `previous`.
    Changed { previous: String },
    Fresh,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

#[derive(Debug, Clone)]
pub struct MetaStore {
    meta_path: PathBuf,
    snapshot_dir: PathBuf,
}

impl MetaStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            meta_path: layout.meta_path.clone(),
            snapshot_dir: layout.snapshot_dir.clone(),
        }
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn snapshot_path(&self, checksum: &str) -> PathBuf {
        self.snapshot_dir.join(format!("meta.{checksum}.json"))
    }

    /// Where a record belongs: the canonical path, or its snapshot once
    /// superseded.
    pub fn destination(&self, meta: &MetaObject) -> PathBuf {
        if meta.is_expired {
            self.snapshot_path(&meta.checksum)
        } else {
            self.meta_path.clone()
        }
    }

    /// Reads and parses the persisted record.
    pub fn load(&self) -> Result<MetaObject, MetaError> {
        self.read_current().map(|(meta, _)| meta)
    }

    fn read_current(&self) -> Result<(MetaObject, Vec<u8>), MetaError> {
        let raw = fs::read(&self.meta_path).map_err(|source| MetaError::Read {
            path: self.meta_path.clone(),
            source,
        })?;
        let meta = serde_json::from_slice(&raw).map_err(|source| MetaError::Parse {
            path: self.meta_path.clone(),
            source,
        })?;
        Ok((meta, raw))
    }

    /// Compares `incoming` with the persisted record.
    ///
    /// When the checksums differ the persisted file is copied verbatim into
    /// the snapshot directory before anything else happens. No file is
    /// touched on any other outcome.
    pub fn detect(&self, incoming: &MetaObject) -> Result<Staleness, MetaError> {
        let (mut current, raw) = match self.read_current() {
            Ok(found) => found,
            Err(MetaError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %self.meta_path.display(), "no metadata yet");
                return Ok(Staleness::Missing);
            }
            Err(err) => {
                tracing::warn!(error = %err, "unusable metadata");
                return Ok(Staleness::Unreadable(err.to_string()));
            }
        };

        current.is_expired = current.checksum != incoming.checksum;
        if !current.is_expired {
            return Ok(Staleness::Fresh);
        }

        let archive = self.persist(&self.destination(&current), &raw)?;
        tracing::info!(
            path = %archive.display(),
            previous = %current.checksum,
            "archived superseded metadata"
        );

        Ok(Staleness::Changed {
            previous: current.checksum,
        })
    }

    /// Persists `meta` at its destination.
    pub fn save(&self, meta: &MetaObject) -> Result<PathBuf, MetaError> {
        let rendered = ContentFile::Metadata(meta).render("")?;
        let destination = self.persist(&self.destination(meta), &rendered.bytes)?;
        tracing::debug!(path = %destination.display(), "saved metadata");
        Ok(destination)
    }

    /// Writes `bytes` to a temporary sibling of `destination`, then renames
    /// it into place.
    fn persist(&self, destination: &Path, bytes: &[u8]) -> Result<PathBuf, MetaError> {
        let tmp = destination.with_extension("json.tmp");
        write_file(&tmp, bytes)?;
        fs::rename(&tmp, destination).map_err(|source| MetaError::Rename {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(destination.to_path_buf())
    }
}
