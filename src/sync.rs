use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{AppConfig, Layout};
use crate::meta::{MetaError, MetaStore, Staleness};
use crate::metrics::Metrics;
use crate::site::{MetaObject, SiteData};
use crate::source::{Source, SourceError};
use crate::tree::{SiteTree, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error("payload is malformed: {0}")]
    PayloadMalformed(#[from] serde_json::Error),
    #[error("unable to create directory {path}: {source}")]
    DirSetup { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Metadata(#[from] MetaError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl SyncError {
    /// Errors that mean the environment is unusable, not just this cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::DirSetup { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated {
        staleness: Staleness,
        forced: bool,
        stories: usize,
        written: usize,
        failed: usize,
    },
    UpToDate,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Updated {
                stories,
                written,
                failed,
                ..
            } => write!(
                f,
                "updated {stories} stories ({written} files written, {failed} failed)"
            ),
            SyncOutcome::UpToDate => f.write_str("nothing to update"),
        }
    }
}

/// Runs sync cycles: fetch, detect, materialize.
///
/// At most one cycle runs at a time; concurrent callers wait for the
/// in-flight cycle and then run their own, which is normally a no-op.
#[derive(Debug)]
pub struct SyncEngine {
    source: Source,
    meta: MetaStore,
    tree: Arc<SiteTree>,
    dirs: [PathBuf; 2],
    suffix: String,
    force_update: bool,
    metrics: Arc<Metrics>,
    in_flight: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        source: Source,
        layout: &Layout,
        suffix: impl Into<String>,
        force_update: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            meta: MetaStore::new(layout),
            tree: Arc::new(SiteTree::new(&layout.content_dir)),
            dirs: [layout.content_dir.clone(), layout.snapshot_dir.clone()],
            suffix: suffix.into(),
            force_update,
            metrics,
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &AppConfig, metrics: Arc<Metrics>) -> Result<Self, SourceError> {
        Ok(Self::new(
            Source::from_config(cfg)?,
            &cfg.layout(),
            cfg.story_suffix(),
            cfg.mode_force_update,
            metrics,
        ))
    }

    pub fn tree(&self) -> Arc<SiteTree> {
        Arc::clone(&self.tree)
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn run_cycle(&self) -> Result<SyncOutcome, SyncError> {
        let _in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.metrics.inc_sync_cycle();
        let result = self.cycle();
        match &result {
            Ok(SyncOutcome::Updated { failed, .. }) => {
                self.metrics.inc_sync_update();
                self.metrics.add_write_failures(*failed as u64);
            }
            Ok(SyncOutcome::UpToDate) => self.metrics.inc_sync_noop(),
            Err(_) => self.metrics.inc_sync_failure(),
        }
        result
    }

    fn cycle(&self) -> Result<SyncOutcome, SyncError> {
        let raw = self.source.fetch()?;
        let site = SiteData::parse(&raw)?;
        self.ensure_dirs()?;

        let meta = MetaObject::from_payload(&site, &raw);
        let staleness = self.meta.detect(&meta)?;

        if !staleness.is_stale() && !self.force_update {
            tracing::info!(checksum = %meta.checksum, "nothing to update");
            return Ok(SyncOutcome::UpToDate);
        }

        tracing::info!(
            site = %site.site_name,
            stories = site.stories.len(),
            force_update = self.force_update,
            staleness = ?staleness,
            "syncing content"
        );

        let report = self.tree.publish(&site, &self.suffix)?;
        self.meta.save(&meta)?;

        Ok(SyncOutcome::Updated {
            staleness,
            forced: self.force_update,
            stories: site.stories.len(),
            written: report.written.len(),
            failed: report.failures.len(),
        })
    }

    fn ensure_dirs(&self) -> Result<(), SyncError> {
        for dir in &self.dirs {
            fs::create_dir_all(dir).map_err(|source| SyncError::DirSetup {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
