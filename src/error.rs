use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// Coarse classification of every failure the crate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Validation,
    Filesystem,
    Cancelled,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StplugError {
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("an operation for {0} is already running")]
    AlreadyRunning(u32),

    #[error("missing download URL")]
    MissingUrl,

    #[error("install path does not exist: {0}")]
    MissingInstallPath(Utf8PathBuf),

    #[error("no fix log found in {0}, cannot un-fix")]
    NoFixLog(Utf8PathBuf),

    #[error("could not locate the install directory: {0}")]
    InstallNotFound(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse source manifest: {0}")]
    ManifestParse(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("downloaded file is not a zip archive (magic {magic})")]
    InvalidArchive { magic: String },

    #[error("no numeric .lua file found in archive")]
    NoScriptEntry,

    #[error("unsafe archive entry path: {0}")]
    UnsafeEntry(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("No sources available")]
    NoSources,

    #[error("Processing failed: {0}")]
    Processing(#[source] Box<StplugError>),

    #[error("Not available on any source")]
    Exhausted(#[source] Box<StplugError>),

    #[error("cancelled by user")]
    Cancelled,
}

impl StplugError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StplugError::Http(_) | StplugError::HttpStatus { .. } => ErrorKind::Network,
            StplugError::InvalidResourceId(_)
            | StplugError::AlreadyRunning(_)
            | StplugError::MissingUrl
            | StplugError::MissingInstallPath(_)
            | StplugError::NoFixLog(_)
            | StplugError::InstallNotFound(_)
            | StplugError::ConfigRead(_)
            | StplugError::ConfigParse(_)
            | StplugError::ManifestParse(_)
            | StplugError::InvalidArchive { .. }
            | StplugError::NoScriptEntry
            | StplugError::UnsafeEntry(_)
            | StplugError::NoSources => ErrorKind::Validation,
            StplugError::Processing(inner) | StplugError::Exhausted(inner) => inner.kind(),
            StplugError::Archive(_) | StplugError::Filesystem(_) => ErrorKind::Filesystem,
            StplugError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Network failures may succeed on a later attempt; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            StplugError::Http(_) => true,
            StplugError::HttpStatus { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StplugError::Cancelled)
    }
}

pub(crate) fn fs_err(err: std::io::Error) -> StplugError {
    StplugError::Filesystem(err.to_string())
}
