use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// One story as delivered by the content API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Story {
    #[serde(deserialize_with = "null_as_default")]
    pub uid: String,
    #[serde(deserialize_with = "null_as_default")]
    pub anchor: String,
    #[serde(deserialize_with = "null_as_default")]
    pub canonical_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub credits: String,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(deserialize_with = "null_as_default")]
    pub story_date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub is_landing: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub updated_at: String,
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hash: String,
}

impl Story {
    /// File name for this story, or `None` when the anchor cannot be used as
    /// a single path segment.
    pub fn file_name(&self, suffix: &str) -> Option<String> {
        is_safe_segment(&self.anchor).then(|| format!("{}{}", self.anchor, suffix))
    }
}

/// Parsed payload for a single sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SiteData {
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub entity: String,
    #[serde(deserialize_with = "null_as_default")]
    pub locale: String,
    #[serde(deserialize_with = "null_as_default")]
    pub site_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub logo_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub homepage_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub stories: Vec<Story>,
    #[serde(deserialize_with = "null_as_default")]
    pub error_page: String,
}

impl SiteData {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Record of the last accepted payload, persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaObject {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub homepage_url: String,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
    /// Set on a previously persisted record once a newer checksum supersedes
    /// it; decides whether the record belongs in the snapshot directory.
    #[serde(skip)]
    pub is_expired: bool,
}

impl MetaObject {
    pub fn from_payload(site: &SiteData, raw: &[u8]) -> Self {
        Self {
            title: site.title.clone(),
            entity: site.entity.clone(),
            homepage_url: site.homepage_url.clone(),
            stories: site.stories.clone(),
            checksum: checksum(raw),
            updated_at: Utc::now(),
            is_expired: false,
        }
    }
}

/// Decodes an explicit JSON `null` as the field's empty value, the same as
/// an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Lowercase hex SHA-256 of the raw payload bytes.
pub fn checksum(raw: &[u8]) -> String {
    format!("{:x}", Sha256::digest(raw))
}

pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
