use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::StplugError;
use crate::library;

pub const DEFAULT_CONFIG_FILE: &str = "stplug.json";
pub const STEAM_PATH_ENV: &str = "STPLUG_STEAM_PATH";

const DEFAULT_GENERIC_FIX_URL: &str = "https://files.luatools.work/GameBypasses/<appid>.zip";
const DEFAULT_ONLINE_FIX_URL: &str = "https://files.luatools.work/OnlineFix1/<appid>.zip";
const DEFAULT_NAME_LOOKUP_URL: &str = "https://store.steampowered.com/api/appdetails?appids=<appid>";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub steam_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub sources_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub fixes: Option<FixEndpoints>,
    #[serde(default)]
    pub name_lookup_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FixEndpoints {
    pub generic: String,
    pub online: String,
}

impl Default for FixEndpoints {
    fn default() -> Self {
        Self {
            generic: DEFAULT_GENERIC_FIX_URL.to_string(),
            online: DEFAULT_ONLINE_FIX_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub fix_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("stplug/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            fix_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: Utf8PathBuf,
    pub steam_path: Option<Utf8PathBuf>,
    pub sources_file: Utf8PathBuf,
    pub http: HttpSettings,
    pub fixes: FixEndpoints,
    pub name_lookup_url: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `stplug.json` in the working directory when present,
    /// or falls back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, StplugError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| StplugError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| StplugError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, StplugError> {
        let data_dir = match config.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let steam_path = std::env::var(STEAM_PATH_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(Utf8PathBuf::from)
            .or(config.steam_path)
            .or_else(library::detect_steam_root);

        let sources_file = config
            .sources_file
            .unwrap_or_else(|| data_dir.join("api.json"));

        let mut http = HttpSettings::default();
        if let Some(secs) = config.http_timeout_secs {
            http.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(agent) = config.user_agent.filter(|agent| !agent.trim().is_empty()) {
            http.user_agent = agent;
        }

        let name_lookup_url = match config.name_lookup_url {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url),
            None => Some(DEFAULT_NAME_LOOKUP_URL.to_string()),
        };

        Ok(ResolvedConfig {
            data_dir,
            steam_path,
            sources_file,
            http,
            fixes: config.fixes.unwrap_or_default(),
            name_lookup_url,
        })
    }
}

fn default_data_dir() -> Result<Utf8PathBuf, StplugError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("stplug")).ok())
        .ok_or_else(|| StplugError::Filesystem("unable to resolve data directory".to_string()))
}
