use std::collections::BTreeMap;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::ResourceId;
use crate::error::StplugError;

static VDF_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]*"|\{|\}"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdfValue {
    Str(String),
    Map(VdfMap),
}

pub type VdfMap = BTreeMap<String, VdfValue>;

impl VdfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VdfValue::Str(value) => Some(value),
            VdfValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&VdfMap> {
        match self {
            VdfValue::Map(map) => Some(map),
            VdfValue::Str(_) => None,
        }
    }
}

/// Minimal KeyValues reader, enough for `libraryfolders.vdf` and
/// `appmanifest_*.acf`. Unbalanced braces are tolerated.
pub fn parse_vdf(content: &str) -> VdfMap {
    let tokens = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .flat_map(|line| VDF_TOKEN.find_iter(line).map(|found| found.as_str()))
        .collect::<Vec<_>>();

    let mut stack: Vec<(Option<String>, VdfMap)> = vec![(None, VdfMap::new())];
    let mut pending_key: Option<String> = None;

    for token in tokens {
        match token {
            "{" => {
                if let Some(key) = pending_key.take() {
                    stack.push((Some(key), VdfMap::new()));
                }
            }
            "}" => {
                if stack.len() > 1 {
                    if let Some((Some(key), map)) = stack.pop() {
                        if let Some((_, parent)) = stack.last_mut() {
                            parent.insert(key, VdfValue::Map(map));
                        }
                    }
                }
            }
            quoted => {
                let value = quoted.trim_matches('"').to_string();
                match pending_key.take() {
                    None => pending_key = Some(value),
                    Some(key) => {
                        if let Some((_, current)) = stack.last_mut() {
                            current.insert(key, VdfValue::Str(value));
                        }
                    }
                }
            }
        }
    }

    // Close anything left open by a truncated file.
    while stack.len() > 1 {
        if let Some((Some(key), map)) = stack.pop() {
            if let Some((_, parent)) = stack.last_mut() {
                parent.insert(key, VdfValue::Map(map));
            }
        }
    }
    stack.pop().map(|(_, map)| map).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledApp {
    pub id: ResourceId,
    pub name: String,
    pub install_path: Utf8PathBuf,
}

/// Finds where an app is installed.
pub trait InstallLocator: Send + Sync {
    fn install_path(&self, id: ResourceId) -> Result<Utf8PathBuf, StplugError>;
    fn installed_apps(&self) -> Result<Vec<InstalledApp>, StplugError>;
}

#[derive(Debug, Clone)]
pub struct SteamLibrary {
    steam_root: Option<Utf8PathBuf>,
}

struct LibraryFolder {
    path: Utf8PathBuf,
    apps: Vec<String>,
}

impl SteamLibrary {
    pub fn new(steam_root: Option<Utf8PathBuf>) -> Self {
        Self { steam_root }
    }

    fn root(&self) -> Result<&Utf8Path, StplugError> {
        self.steam_root.as_deref().ok_or_else(|| {
            StplugError::InstallNotFound("could not find Steam installation path".to_string())
        })
    }

    fn library_folders(&self) -> Result<Vec<LibraryFolder>, StplugError> {
        let root = self.root()?;
        let candidates = [
            root.join("config").join("libraryfolders.vdf"),
            root.join("steamapps").join("libraryfolders.vdf"),
        ];
        let vdf_path = candidates
            .iter()
            .find(|path| path.as_std_path().exists())
            .ok_or_else(|| {
                StplugError::InstallNotFound("could not find libraryfolders.vdf".to_string())
            })?;
        let content = fs::read_to_string(vdf_path.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("read {vdf_path}: {err}")))?;
        let parsed = parse_vdf(&content);

        let folders = parsed
            .get("libraryfolders")
            .and_then(VdfValue::as_map)
            .map(|folders| {
                folders
                    .values()
                    .filter_map(VdfValue::as_map)
                    .filter_map(|folder| {
                        let path = folder.get("path").and_then(VdfValue::as_str)?;
                        if path.is_empty() {
                            return None;
                        }
                        let apps = folder
                            .get("apps")
                            .and_then(VdfValue::as_map)
                            .map(|apps| apps.keys().cloned().collect())
                            .unwrap_or_default();
                        Some(LibraryFolder {
                            path: Utf8PathBuf::from(path.replace("\\\\", "\\")),
                            apps,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(folders)
    }

    fn read_app_manifest(
        library: &Utf8Path,
        manifest_path: &Utf8Path,
        id: ResourceId,
    ) -> Result<InstalledApp, StplugError> {
        let content = fs::read_to_string(manifest_path.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("read {manifest_path}: {err}")))?;
        let parsed = parse_vdf(&content);
        let state = parsed.get("AppState").and_then(VdfValue::as_map);
        let install_dir = state
            .and_then(|state| state.get("installdir"))
            .and_then(VdfValue::as_str)
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| {
                StplugError::InstallNotFound(format!("installdir missing in {manifest_path}"))
            })?;
        let name = state
            .and_then(|state| state.get("name"))
            .and_then(VdfValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown Game ({id})"));
        Ok(InstalledApp {
            id,
            name,
            install_path: library.join("steamapps").join("common").join(install_dir),
        })
    }
}

impl InstallLocator for SteamLibrary {
    fn install_path(&self, id: ResourceId) -> Result<Utf8PathBuf, StplugError> {
        let folders = self.library_folders()?;
        let key = id.to_string();
        let manifest_name = format!("appmanifest_{id}.acf");

        let owner = folders
            .iter()
            .find(|folder| folder.apps.contains(&key))
            .map(|folder| folder.path.clone())
            .or_else(|| {
                debug!("{id} not listed in libraryfolders.vdf, scanning libraries");
                folders
                    .iter()
                    .find(|folder| {
                        folder
                            .path
                            .join("steamapps")
                            .join(&manifest_name)
                            .as_std_path()
                            .exists()
                    })
                    .map(|folder| folder.path.clone())
            })
            .ok_or_else(|| StplugError::InstallNotFound(format!("{id} is not installed")))?;

        let manifest_path = owner.join("steamapps").join(&manifest_name);
        if !manifest_path.as_std_path().exists() {
            return Err(StplugError::InstallNotFound(format!("{id} is not installed")));
        }
        let app = Self::read_app_manifest(&owner, &manifest_path, id)?;
        if !app.install_path.as_std_path().exists() {
            return Err(StplugError::InstallNotFound(format!(
                "game directory not found: {}",
                app.install_path
            )));
        }
        Ok(app.install_path)
    }

    fn installed_apps(&self) -> Result<Vec<InstalledApp>, StplugError> {
        let mut apps = Vec::new();
        for folder in self.library_folders()? {
            let steamapps = folder.path.join("steamapps");
            let entries = match fs::read_dir(steamapps.as_std_path()) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("skipping library {}: {err}", folder.path);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                let Some(id) = file_name
                    .strip_prefix("appmanifest_")
                    .and_then(|rest| rest.strip_suffix(".acf"))
                    .and_then(|raw| raw.parse::<ResourceId>().ok())
                else {
                    continue;
                };
                let manifest_path = steamapps.join(file_name);
                match Self::read_app_manifest(&folder.path, &manifest_path, id) {
                    Ok(app) if app.install_path.as_std_path().exists() => apps.push(app),
                    Ok(_) => {}
                    Err(err) => warn!("failed to process {manifest_path}: {err}"),
                }
            }
        }
        apps.sort_by_key(|app| app.id);
        Ok(apps)
    }
}

/// Probes the usual per-platform Steam locations.
pub fn detect_steam_root() -> Option<Utf8PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dirs) = BaseDirs::new() {
        let home = dirs.home_dir();
        candidates.push(home.join(".steam").join("steam"));
        candidates.push(home.join(".local").join("share").join("Steam"));
        candidates.push(home.join("Library").join("Application Support").join("Steam"));
    }
    candidates.push("C:\\Program Files (x86)\\Steam".into());
    candidates.push("C:\\Program Files\\Steam".into());

    candidates
        .into_iter()
        .filter(|path| path.join("config").exists())
        .find_map(|path| Utf8PathBuf::from_path_buf(path).ok())
}
