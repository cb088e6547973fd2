//! The served content tree and the files that make up one generation of it.
//!
//! A generation is written into a staging directory next to the live one and
//! then swapped in with two renames under an exclusive lock. Readers hold the
//! shared side of that lock while they resolve and open a file, so they see
//! either the previous or the next generation in full.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use crate::render::render_sitemap;
use crate::site::{MetaObject, SiteData, Story};

pub const SITEMAP_FILE: &str = "sitemap.xml";
pub const META_FILE: &str = "meta.json";

/// Everything the materializer knows how to write.
#[derive(Debug, Clone, Copy)]
pub enum ContentFile<'a> {
    Story(&'a Story),
    ErrorPage(&'a str),
    Sitemap(&'a [Story]),
    Metadata(&'a MetaObject),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("refusing to write story with unsafe anchor {anchor:?}")]
    UnsafeName { anchor: String },
    #[error("unable to open {path} for writing: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed writing {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Staging { path: PathBuf, source: io::Error },
    #[error("failed to swap {staging} into {live}: {source}")]
    Swap {
        staging: PathBuf,
        live: PathBuf,
        source: io::Error,
    },
}

/// Files written into a freshly published generation.
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub written: Vec<PathBuf>,
    pub failures: Vec<WriteError>,
}

impl ContentFile<'_> {
    pub fn render(&self, suffix: &str) -> Result<RenderedFile, WriteError> {
        let (name, bytes) = match self {
            ContentFile::Story(story) => {
                let name = story
                    .file_name(suffix)
                    .ok_or_else(|| WriteError::UnsafeName {
                        anchor: story.anchor.clone(),
                    })?;
                (name, story.content.as_bytes().to_vec())
            }
            ContentFile::ErrorPage(body) => (format!("404{suffix}"), body.as_bytes().to_vec()),
            ContentFile::Sitemap(stories) => {
                (SITEMAP_FILE.to_string(), render_sitemap(stories).into_bytes())
            }
            ContentFile::Metadata(meta) => {
                let bytes = serde_json::to_vec(meta).map_err(|source| WriteError::Encode {
                    name: META_FILE,
                    source,
                })?;
                (META_FILE.to_string(), bytes)
            }
        };
        Ok(RenderedFile { name, bytes })
    }

    /// Renders the file and writes it under `dir`, returning the written path.
    pub fn write_into(&self, dir: &Path, suffix: &str) -> Result<PathBuf, WriteError> {
        let rendered = self.render(suffix)?;
        let path = dir.join(&rendered.name);
        write_file(&path, &rendered.bytes)?;
        Ok(path)
    }
}

/// Create-or-truncate, then write. A failed write leaves the partial file.
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| WriteError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(bytes).map_err(|source| WriteError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
pub struct SiteTree {
    content_dir: PathBuf,
    swap_lock: RwLock<()>,
}

impl SiteTree {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
            swap_lock: RwLock::new(()),
        }
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Shared guard; hold it while resolving and opening served files.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.swap_lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.sibling("staging")
    }

    fn previous_dir(&self) -> PathBuf {
        self.sibling("previous")
    }

    fn sibling(&self, kind: &str) -> PathBuf {
        let name = self
            .content_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "www".to_string());
        self.content_dir.with_file_name(format!(".{name}.{kind}"))
    }

    /// Writes every story, the error page and the sitemap into a staging
    /// directory, then swaps it in place of the live tree.
    ///
    /// Individual file failures are collected in the report and do not stop
    /// the rest of the generation from being written.
    pub fn publish(&self, site: &SiteData, suffix: &str) -> Result<GenerationReport, TreeError> {
        let staging = self.staging_dir();
        remove_dir_if_exists(&staging)
            .and_then(|()| fs::create_dir_all(&staging))
            .map_err(|source| TreeError::Staging {
                path: staging.clone(),
                source,
            })?;

        let files = site
            .stories
            .iter()
            .map(ContentFile::Story)
            .chain([
                ContentFile::ErrorPage(&site.error_page),
                ContentFile::Sitemap(&site.stories),
            ]);

        let mut report = GenerationReport::default();
        for file in files {
            match file.write_into(&staging, suffix) {
                Ok(path) => {
                    tracing::debug!(path = %path.display(), "saved");
                    report.written.push(path);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping content file");
                    report.failures.push(err);
                }
            }
        }

        self.swap_in(&staging)?;
        Ok(report)
    }

    fn swap_in(&self, staging: &Path) -> Result<(), TreeError> {
        let previous = self.previous_dir();
        remove_dir_if_exists(&previous).map_err(|source| TreeError::Staging {
            path: previous.clone(),
            source,
        })?;

        {
            let _exclusive = self
                .swap_lock
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            let had_live = match fs::rename(&self.content_dir, &previous) {
                Ok(()) => true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                Err(source) => {
                    return Err(TreeError::Swap {
                        staging: staging.to_path_buf(),
                        live: self.content_dir.clone(),
                        source,
                    })
                }
            };

            if let Err(source) = fs::rename(staging, &self.content_dir) {
                if had_live {
                    if let Err(err) = fs::rename(&previous, &self.content_dir) {
                        tracing::error!(error = %err, "failed to restore previous generation");
                    }
                }
                return Err(TreeError::Swap {
                    staging: staging.to_path_buf(),
                    live: self.content_dir.clone(),
                    source,
                });
            }
        }

        tracing::info!(path = %self.content_dir.display(), "published new generation");
        if let Err(err) = remove_dir_if_exists(&previous) {
            tracing::warn!(
                path = %previous.display(),
                error = %err,
                "failed to purge previous generation"
            );
        }
        Ok(())
    }

    /// Opens a file inside the tree; `None` unless it is a regular file.
    pub fn open_file(path: &Path) -> Option<File> {
        let file = File::open(path).ok()?;
        let is_file = file.metadata().map(|m| m.is_file()).unwrap_or(false);
        is_file.then_some(file)
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
