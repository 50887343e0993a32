use std::fs;
use std::io;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::ResourceId;
use crate::error::StplugError;

static TRAILING_COMMA_ARRAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*]").unwrap());
static TRAILING_COMMA_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*}\s*$").unwrap());

/// One ranked mirror. Order in the manifest is fallback priority.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceDescriptor {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(rename = "url", default)]
    pub url_template: String,
    #[serde(default = "default_success_code")]
    pub success_code: u16,
    #[serde(default = "default_unavailable_code")]
    pub unavailable_code: u16,
    #[serde(default)]
    pub enabled: bool,
}

/// How a source's response code steers the fallback walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Unavailable,
    Unexpected,
}

impl SourceDescriptor {
    pub fn new(name: &str, url_template: &str, success_code: u16, unavailable_code: u16) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            success_code,
            unavailable_code,
            enabled: true,
        }
    }

    pub fn url_for(&self, id: ResourceId) -> String {
        id.substitute(&self.url_template)
    }

    pub fn classify(&self, status: u16) -> ResponseClass {
        if status == self.unavailable_code {
            ResponseClass::Unavailable
        } else if status == self.success_code {
            ResponseClass::Success
        } else {
            ResponseClass::Unexpected
        }
    }
}

fn default_name() -> String {
    "Unknown".to_string()
}

fn default_success_code() -> u16 {
    200
}

fn default_unavailable_code() -> u16 {
    404
}

#[derive(Debug, Default, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    api_list: Vec<SourceDescriptor>,
}

/// Supplies the ordered sources a download walks through.
pub trait SourceProvider: Send + Sync {
    fn sources(&self) -> Result<Vec<SourceDescriptor>, StplugError>;
}

/// A fixed list, mostly useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct SourceManifest {
    sources: Vec<SourceDescriptor>,
}

impl SourceManifest {
    pub fn new(sources: Vec<SourceDescriptor>) -> Self {
        Self { sources }
    }

    /// Parses manifest text, keeping only enabled entries.
    pub fn parse(text: &str) -> Result<Self, StplugError> {
        let normalized = normalize_manifest_text(text);
        if normalized.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: ManifestDocument = serde_json::from_str(&normalized)
            .map_err(|err| StplugError::ManifestParse(err.to_string()))?;
        Ok(Self {
            sources: document
                .api_list
                .into_iter()
                .filter(|source| source.enabled)
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SourceProvider for SourceManifest {
    fn sources(&self) -> Result<Vec<SourceDescriptor>, StplugError> {
        Ok(self.sources.clone())
    }
}

/// Re-reads `api.json` on every download so edits apply without restart.
/// A damaged file that normalization can repair is rewritten in place.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: Utf8PathBuf,
}

impl ManifestFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn load(&self) -> Result<SourceManifest, StplugError> {
        let text = match fs::read_to_string(self.path.as_std_path()) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SourceManifest::default()),
            Err(err) => return Err(StplugError::Filesystem(format!("read {}: {err}", self.path))),
        };
        let normalized = normalize_manifest_text(&text);
        if !normalized.is_empty()
            && normalized != text
            && fs::write(self.path.as_std_path(), &normalized).is_ok()
        {
            info!("normalized {} to valid JSON", self.path);
        }
        SourceManifest::parse(&normalized)
    }
}

impl SourceProvider for ManifestFile {
    fn sources(&self) -> Result<Vec<SourceDescriptor>, StplugError> {
        self.load()?.sources()
    }
}

/// Repairs the usual hand-editing damage: trailing commas and a bare
/// `"api_list": [...]` without the enclosing object. Text that still fails to
/// parse is returned unchanged.
pub fn normalize_manifest_text(text: &str) -> String {
    let mut content = text.trim().to_string();
    if content.is_empty() {
        return content;
    }

    content = TRAILING_COMMA_ARRAY.replace_all(&content, "]").into_owned();
    content = TRAILING_COMMA_END.replace(&content, "}").into_owned();

    let bare = content.starts_with("\"api_list\"")
        || content.starts_with("'api_list'")
        || content.starts_with("api_list");
    if bare {
        if !content.starts_with('{') {
            content.insert(0, '{');
        }
        if !content.ends_with('}') {
            content = format!("{}}}", content.trim_end_matches(','));
        }
    }

    if serde_json::from_str::<serde_json::Value>(&content).is_ok() {
        content
    } else {
        text.to_string()
    }
}
