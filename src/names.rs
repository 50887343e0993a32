use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::ResourceId;
use crate::http::HttpSource;
use crate::roster::InstalledRoster;

const MIN_LOOKUP_INTERVAL: Duration = Duration::from_millis(300);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub trait NameResolver: Send + Sync {
    /// Best-effort display name; may contact the network.
    fn resolve(&self, id: ResourceId) -> Option<String>;

    /// Display name from local sources only.
    fn cached(&self, id: ResourceId) -> Option<String>;
}

/// Resolver that never knows anything. Handy when names do not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNames;

impl NameResolver for NoNames {
    fn resolve(&self, _id: ResourceId) -> Option<String> {
        None
    }

    fn cached(&self, _id: ResourceId) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct AppListEntry {
    appid: u32,
    name: Option<String>,
}

struct RemoteLookup {
    http: Arc<dyn HttpSource>,
    url_template: String,
}

/// Lookup order: memory cache, roster file, event log, local app list, then
/// the remote store endpoint (rate limited). Remote misses are remembered.
pub struct CachedNameResolver {
    roster: InstalledRoster,
    applist_path: Utf8PathBuf,
    remote: Option<RemoteLookup>,
    cache: Mutex<HashMap<ResourceId, String>>,
    misses: Mutex<HashSet<ResourceId>>,
    logged: OnceLock<HashMap<ResourceId, String>>,
    applist: OnceLock<HashMap<ResourceId, String>>,
    last_lookup: Mutex<Option<Instant>>,
}

impl CachedNameResolver {
    pub fn new(roster: InstalledRoster, applist_path: Utf8PathBuf) -> Self {
        Self {
            roster,
            applist_path,
            remote: None,
            cache: Mutex::new(HashMap::new()),
            misses: Mutex::new(HashSet::new()),
            logged: OnceLock::new(),
            applist: OnceLock::new(),
            last_lookup: Mutex::new(None),
        }
    }

    /// Enables remote lookups against `url_template` (`<appid>` substituted).
    pub fn with_remote(mut self, http: Arc<dyn HttpSource>, url_template: String) -> Self {
        self.remote = Some(RemoteLookup { http, url_template });
        self
    }

    fn applist(&self) -> &HashMap<ResourceId, String> {
        self.applist.get_or_init(|| {
            let Ok(content) = fs::read_to_string(self.applist_path.as_std_path()) else {
                return HashMap::new();
            };
            match serde_json::from_str::<Vec<AppListEntry>>(&content) {
                Ok(entries) => {
                    let map = entries
                        .into_iter()
                        .filter_map(|entry| {
                            let id = ResourceId::new(entry.appid).ok()?;
                            let name = entry.name?.trim().to_string();
                            (!name.is_empty()).then_some((id, name))
                        })
                        .collect::<HashMap<_, _>>();
                    info!("loaded {} app names from {}", map.len(), self.applist_path);
                    map
                }
                Err(err) => {
                    warn!("app list {} is not valid: {err}", self.applist_path);
                    HashMap::new()
                }
            }
        })
    }

    fn remember(&self, id: ResourceId, name: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, name.to_string());
    }

    fn fetch_remote(&self, id: ResourceId) -> Option<String> {
        let remote = self.remote.as_ref()?;
        {
            let mut last = self
                .last_lookup
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < MIN_LOOKUP_INTERVAL {
                    thread::sleep(MIN_LOOKUP_INTERVAL - elapsed);
                }
            }
            *last = Some(Instant::now());
        }

        let url = id.substitute(&remote.url_template);
        let response = match remote.http.get(&url, LOOKUP_TIMEOUT) {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                warn!("name lookup for {id} returned {}", response.status);
                return None;
            }
            Err(err) => {
                warn!("name lookup for {id} failed: {err}");
                return None;
            }
        };
        let body: Value = match serde_json::from_reader(response.body) {
            Ok(body) => body,
            Err(err) => {
                warn!("name lookup for {id} returned invalid JSON: {err}");
                return None;
            }
        };
        store_name_from(&body, id)
    }
}

/// Extracts `{"<id>": {"data": {"name": ...}}}`.
pub fn store_name_from(body: &Value, id: ResourceId) -> Option<String> {
    body.get(id.to_string())
        .and_then(|entry| entry.get("data"))
        .and_then(|data| data.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

impl NameResolver for CachedNameResolver {
    fn resolve(&self, id: ResourceId) -> Option<String> {
        if let Some(name) = self.cached(id) {
            return Some(name);
        }
        if self
            .misses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
        {
            return None;
        }
        match self.fetch_remote(id) {
            Some(name) => {
                self.remember(id, &name);
                Some(name)
            }
            None => {
                self.misses
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id);
                None
            }
        }
    }

    fn cached(&self, id: ResourceId) -> Option<String> {
        if let Some(name) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Some(name.clone());
        }
        let found = self
            .roster
            .name_of(id)
            .or_else(|| {
                self.logged
                    .get_or_init(|| self.roster.logged_names())
                    .get(&id)
                    .cloned()
            })
            .or_else(|| self.applist().get(&id).cloned())?;
        self.remember(id, &found);
        Some(found)
    }
}
