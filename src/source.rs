use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, USER_AGENT};

use crate::config::AppConfig;

const CLIENT_USER_AGENT: &str = concat!("nrtk-sync/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY_CHARS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("remote request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote returned HTTP {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unable to read local payload {path}: {source}")]
    Local { path: PathBuf, source: io::Error },
    #[error("remote credential must not be empty")]
    MissingCredential,
}

/// Authenticated client for the project endpoint of the content API.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    url: String,
    token: String,
    http: Client,
}

impl RemoteSource {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SourceError::MissingCredential);
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            token,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fetch(&self) -> Result<Vec<u8>, SourceError> {
        tracing::info!(url = %self.url, "fetching payload");
        let response = self
            .http
            .get(&self.url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body: String = response
                .text()
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            return Err(SourceError::Http { status, body });
        }

        Ok(response.bytes()?.to_vec())
    }
}

/// Where a sync cycle gets its raw payload from.
#[derive(Debug, Clone)]
pub enum Source {
    Remote(RemoteSource),
    Local(PathBuf),
}

impl Source {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, SourceError> {
        if cfg.mode_fetch_local {
            return Ok(Source::Local(cfg.local_path.clone()));
        }
        RemoteSource::new(cfg.remote_url(), cfg.api_token.clone(), cfg.api_timeout())
            .map(Source::Remote)
    }

    pub fn fetch(&self) -> Result<Vec<u8>, SourceError> {
        match self {
            Source::Remote(remote) => remote.fetch(),
            Source::Local(path) => {
                tracing::info!(path = %path.display(), "reading local payload");
                fs::read(path).map_err(|source| SourceError::Local {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}
