use std::fs;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::warn;

use crate::config::ResolvedConfig;
use crate::domain::ResourceId;
use crate::error::StplugError;

const REMOVE_ATTEMPTS: usize = 3;
const REMOVE_DELAY_MS: u64 = 200;

/// On-disk layout: the tool's own data directory and the Steam tree it
/// installs into.
#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    steam_root: Option<Utf8PathBuf>,
}

impl Store {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(config.data_dir.clone(), config.steam_path.clone())
    }

    pub fn new_with_paths(data_root: Utf8PathBuf, steam_root: Option<Utf8PathBuf>) -> Self {
        Self {
            data_root,
            steam_root,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn steam_root(&self) -> Result<&Utf8Path, StplugError> {
        self.steam_root.as_deref().ok_or_else(|| {
            StplugError::InstallNotFound("could not find Steam installation path".to_string())
        })
    }

    pub fn temp_dir(&self) -> Utf8PathBuf {
        self.data_root.join("temp_dl")
    }

    pub fn roster_path(&self) -> Utf8PathBuf {
        self.data_root.join("loadedappids.txt")
    }

    pub fn event_log_path(&self) -> Utf8PathBuf {
        self.data_root.join("appid_log.txt")
    }

    pub fn applist_path(&self) -> Utf8PathBuf {
        self.temp_dir().join("all-appids.json")
    }

    pub fn plugin_dir(&self) -> Result<Utf8PathBuf, StplugError> {
        Ok(self.steam_root()?.join("config").join("stplug-in"))
    }

    pub fn depotcache_dir(&self) -> Result<Utf8PathBuf, StplugError> {
        Ok(self.steam_root()?.join("depotcache"))
    }

    pub fn script_path(&self, id: ResourceId) -> Result<Utf8PathBuf, StplugError> {
        Ok(self.plugin_dir()?.join(format!("{id}.lua")))
    }

    pub fn disabled_script_path(&self, id: ResourceId) -> Result<Utf8PathBuf, StplugError> {
        Ok(self.plugin_dir()?.join(format!("{id}.lua.disabled")))
    }

    pub fn fix_log_path(install_dir: &Utf8Path, id: ResourceId) -> Utf8PathBuf {
        install_dir.join(format!("luatools-fix-log-{id}.log"))
    }

    pub fn ensure_temp_dir(&self) -> Result<Utf8PathBuf, StplugError> {
        let dir = self.temp_dir();
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    /// Creates a uniquely named, empty temp file for one download attempt.
    pub fn reserve_temp_file(&self, prefix: &str) -> Result<Utf8PathBuf, StplugError> {
        let dir = self.ensure_temp_dir()?;
        let temp = Builder::new()
            .prefix(prefix)
            .suffix(".zip")
            .tempfile_in(dir.as_std_path())
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        let (_, path) = temp
            .keep()
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        Utf8PathBuf::from_path_buf(path)
            .map_err(|_| StplugError::Filesystem("invalid temp path".to_string()))
    }

    /// Stages `content` in a uniquely named sibling and renames it over
    /// `path`, so concurrent writers never share a staging file.
    pub fn write_text_atomic(path: &Utf8Path, content: &str) -> Result<(), StplugError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        let mut staged = Builder::new()
            .prefix(&format!(".{}.", path.file_name().unwrap_or("write")))
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        staged
            .write_all(content.as_bytes())
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        staged
            .persist(path.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("replace {path}: {}", err.error)))?;
        Ok(())
    }
}

/// Deletes `path`, retrying briefly to ride out transient locks. Failure is
/// logged, never returned.
pub fn remove_with_retry(path: &Utf8Path) -> bool {
    for attempt in 0..=REMOVE_ATTEMPTS {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => return true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
            Err(err) if attempt == REMOVE_ATTEMPTS => {
                warn!("failed to remove {path}: {err}");
            }
            Err(_) => thread::sleep(Duration::from_millis(REMOVE_DELAY_MS)),
        }
    }
    false
}
