use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;

use crate::domain::ResourceId;
use crate::error::StplugError;
use crate::store::Store;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: ResourceId,
    pub name: String,
}

/// `id:name` lines for every installed script, plus the append-only event log
/// of additions and removals. Clones share one lock, which serializes every
/// read-modify-write of the roster file.
#[derive(Debug, Clone)]
pub struct InstalledRoster {
    path: Utf8PathBuf,
    event_log: Utf8PathBuf,
    lock: Arc<Mutex<()>>,
}

impl InstalledRoster {
    pub fn new(store: &Store) -> Self {
        Self::with_paths(store.roster_path(), store.event_log_path())
    }

    pub fn with_paths(path: Utf8PathBuf, event_log: Utf8PathBuf) -> Self {
        Self {
            path,
            event_log,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>, StplugError> {
        match fs::read_to_string(self.path.as_std_path()) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StplugError::Filesystem(format!("read {}: {err}", self.path))),
        }
    }

    /// Replaces every line for `id` with a single fresh one.
    pub fn upsert(&self, id: ResourceId, name: &str) -> Result<(), StplugError> {
        let _guard = self.guard();
        let prefix = format!("{id}:");
        let mut lines = self
            .read_lines()?
            .into_iter()
            .filter(|line| !line.starts_with(&prefix))
            .collect::<Vec<_>>();
        lines.push(format!("{id}:{name}"));
        Store::write_text_atomic(&self.path, &format!("{}\n", lines.join("\n")))
    }

    /// Returns whether a line was removed.
    pub fn remove(&self, id: ResourceId) -> Result<bool, StplugError> {
        let _guard = self.guard();
        if !self.path.as_std_path().exists() {
            return Ok(false);
        }
        let prefix = format!("{id}:");
        let lines = self.read_lines()?;
        let kept = lines
            .iter()
            .filter(|line| !line.starts_with(&prefix))
            .cloned()
            .collect::<Vec<_>>();
        if kept.len() == lines.len() {
            return Ok(false);
        }
        let content = if kept.is_empty() {
            String::new()
        } else {
            format!("{}\n", kept.join("\n"))
        };
        Store::write_text_atomic(&self.path, &content)?;
        Ok(true)
    }

    pub fn entries(&self) -> Result<Vec<RosterEntry>, StplugError> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(|line| parse_roster_line(line))
            .collect())
    }

    pub fn name_of(&self, id: ResourceId) -> Option<String> {
        self.entries()
            .ok()?
            .into_iter()
            .rev()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name)
    }

    /// Deletes the roster file.
    pub fn dismiss(&self) -> Result<(), StplugError> {
        let _guard = self.guard();
        match fs::remove_file(self.path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StplugError::Filesystem(err.to_string())),
        }
    }

    pub fn log_event(&self, action: &str, id: ResourceId, name: &str) -> Result<(), StplugError> {
        if let Some(parent) = self.event_log.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        }
        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.event_log.as_std_path())
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        writeln!(file, "[{action}] {id} - {name} - {stamp}")
            .map_err(|err| StplugError::Filesystem(err.to_string()))
    }

    /// Names recorded in the event log, later lines winning. Placeholder names
    /// (`Unknown...`/`UNKNOWN...`) are skipped.
    pub fn logged_names(&self) -> HashMap<ResourceId, String> {
        let mut names = HashMap::new();
        let Ok(content) = fs::read_to_string(self.event_log.as_std_path()) else {
            return names;
        };
        for line in content.lines() {
            let Some((_, rest)) = line.split_once(']') else {
                continue;
            };
            let mut parts = rest.trim().splitn(3, " - ");
            let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(id) = id.trim().parse::<ResourceId>() else {
                continue;
            };
            let name = name.trim();
            if !name.is_empty() && !name.starts_with("Unknown") && !name.starts_with("UNKNOWN") {
                names.insert(id, name.to_string());
            }
        }
        names
    }
}

fn parse_roster_line(line: &str) -> Option<RosterEntry> {
    let (id, name) = line.split_once(':')?;
    let id = id.trim().parse::<ResourceId>().ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(RosterEntry {
        id,
        name: name.to_string(),
    })
}
