use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveInstaller, check_signature};
use crate::domain::ResourceId;
use crate::error::StplugError;
use crate::http::HttpSource;
use crate::manifest::{ResponseClass, SourceDescriptor, SourceProvider};
use crate::names::NameResolver;
use crate::roster::{InstalledRoster, RosterEntry, TIMESTAMP_FORMAT};
use crate::status::{
    Accepted, CANCELLED_BY_USER, CancelOutcome, DownloadPhase, DownloadStatus, StatusStore, Ticket,
};
use crate::store::Store;
use crate::stream::stream_to_file;

pub const FALLBACK_SOURCE: &str = "Fallback";

/// What a single source attempt came to. Everything except `Installed` and
/// `ProcessingFailed` moves the walk on to the next source.
#[derive(Debug)]
enum SourceOutcome {
    Installed(Utf8PathBuf),
    Unavailable,
    UnexpectedStatus(u16),
    TransferFailed(StplugError),
    InvalidArchive(StplugError),
    ProcessingFailed(StplugError),
}

/// A script found in the plug-in directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledScript {
    pub id: ResourceId,
    pub name: String,
    pub file_name: String,
    pub disabled: bool,
    pub size: u64,
    pub modified: String,
    pub path: Utf8PathBuf,
}

/// Runs one background worker per resource id, walking the configured
/// sources in order until one yields an installable archive.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    statuses: Arc<StatusStore>,
    http: Arc<dyn HttpSource>,
    sources: Arc<dyn SourceProvider>,
    names: Arc<dyn NameResolver>,
    installer: ArchiveInstaller,
    roster: InstalledRoster,
    store: Store,
    timeout: Duration,
}

impl DownloadOrchestrator {
    pub fn new(
        statuses: Arc<StatusStore>,
        http: Arc<dyn HttpSource>,
        sources: Arc<dyn SourceProvider>,
        names: Arc<dyn NameResolver>,
        store: Store,
        timeout: Duration,
    ) -> Self {
        Self {
            statuses,
            http,
            sources,
            names,
            installer: ArchiveInstaller::new(store.clone()),
            roster: InstalledRoster::new(&store),
            store,
            timeout,
        }
    }

    pub fn start(&self, id: ResourceId) -> Result<Accepted, StplugError> {
        let ticket = self.statuses.downloads.begin(id, DownloadStatus::queued())?;
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("download-{id}"))
            .spawn(move || worker.run(ticket));
        if let Err(err) = spawned {
            self.statuses.downloads.merge(id, |status| {
                status.status = Some(DownloadPhase::Failed);
                status.error = Some(format!("Failed to start worker: {err}"));
            });
            return Err(StplugError::Filesystem(err.to_string()));
        }
        info!("queued download for {id}");
        Ok(Accepted { id })
    }

    pub fn poll(&self, id: ResourceId) -> DownloadStatus {
        self.statuses.downloads.get(id)
    }

    pub fn cancel(&self, id: ResourceId) -> CancelOutcome {
        let outcome = self.statuses.downloads.cancel(id, |status| {
            status.status = Some(DownloadPhase::Cancelled);
            status.error = Some(CANCELLED_BY_USER.to_string());
        });
        if outcome == CancelOutcome::Cancelled {
            info!("cancellation requested for {id}");
        }
        outcome
    }

    pub fn sources(&self) -> Result<Vec<SourceDescriptor>, StplugError> {
        self.sources.sources()
    }

    fn update(&self, ticket: &Ticket, update: impl FnOnce(&mut DownloadStatus)) -> bool {
        self.statuses.downloads.update(ticket, update)
    }

    fn fail(&self, ticket: &Ticket, message: String) {
        warn!("download {} failed: {message}", ticket.id());
        self.update(ticket, |status| {
            status.status = Some(DownloadPhase::Failed);
            status.error = Some(message);
        });
    }

    fn run(&self, ticket: Ticket) {
        let id = ticket.id();
        match self.walk_sources(&ticket) {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => info!("download {id} stopped after cancellation"),
            Err(err) => self.fail(&ticket, err.to_string()),
        }
    }

    fn walk_sources(&self, ticket: &Ticket) -> Result<(), StplugError> {
        let id = ticket.id();
        let sources = self.sources.sources()?;
        if sources.is_empty() {
            return Err(StplugError::NoSources);
        }

        for source in &sources {
            match self.try_source(ticket, source)? {
                SourceOutcome::Installed(path) => return self.finish(ticket, path, &source.name),
                SourceOutcome::ProcessingFailed(err) => {
                    return Err(StplugError::Processing(Box::new(err)));
                }
                SourceOutcome::Unavailable => {
                    info!("{} does not offer {id}", source.name)
                }
                SourceOutcome::UnexpectedStatus(code) => {
                    warn!("{} answered {code} for {id}", source.name)
                }
                SourceOutcome::TransferFailed(err) => {
                    warn!("{} transfer failed for {id}: {err}", source.name)
                }
                SourceOutcome::InvalidArchive(err) => {
                    warn!("{} sent an invalid archive for {id}: {err}", source.name)
                }
            }
        }

        info!("no source offered {id}, writing placeholder script");
        ticket.token().check()?;
        match self.installer.write_placeholder(id, ticket.token()) {
            Ok(path) => self.finish(ticket, path, FALLBACK_SOURCE),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                warn!("placeholder for {id} failed: {err}");
                Err(StplugError::Exhausted(Box::new(err)))
            }
        }
    }

    fn try_source(
        &self,
        ticket: &Ticket,
        source: &SourceDescriptor,
    ) -> Result<SourceOutcome, StplugError> {
        let id = ticket.id();
        let token = ticket.token();
        let url = source.url_for(id);

        self.update(ticket, |status| {
            status.status = Some(DownloadPhase::Checking);
            status.current_source = Some(source.name.clone());
            status.bytes_read = 0;
            status.total_bytes = 0;
        });
        token.check()?;

        debug!("GET {url}");
        let response = match self.http.get(&url, self.timeout) {
            Ok(response) => response,
            Err(err) => return Ok(SourceOutcome::TransferFailed(err)),
        };
        match source.classify(response.status) {
            ResponseClass::Success => {}
            ResponseClass::Unavailable => return Ok(SourceOutcome::Unavailable),
            ResponseClass::Unexpected => {
                return Ok(SourceOutcome::UnexpectedStatus(response.status));
            }
        }

        let temp = self.store.reserve_temp_file(&format!("{id}-"))?;
        self.update(ticket, |status| {
            status.status = Some(DownloadPhase::Downloading);
            status.total_bytes = response.content_length.unwrap_or(0);
            status.destination = Some(temp.clone());
        });

        let mut body = response.body;
        let streamed = stream_to_file(body.as_mut(), &temp, token, |count| {
            self.update(ticket, |status| status.bytes_read = count);
        });
        match streamed {
            Ok(total) => debug!("{total} bytes for {id} from {}", source.name),
            Err(err) => {
                self.installer.discard(&temp);
                if err.is_cancelled() {
                    return Err(err);
                }
                return Ok(SourceOutcome::TransferFailed(err));
            }
        }

        if let Err(err) = check_signature(&temp) {
            self.installer.discard(&temp);
            return Ok(SourceOutcome::InvalidArchive(err));
        }

        self.update(ticket, |status| status.status = Some(DownloadPhase::Processing));
        let installed = self.install(ticket, &temp);
        self.installer.discard(&temp);
        match installed {
            Ok(path) => {
                if let Err(err) = token.check() {
                    self.installer.uninstall(&path);
                    return Err(err);
                }
                Ok(SourceOutcome::Installed(path))
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => Ok(SourceOutcome::ProcessingFailed(err)),
        }
    }

    fn install(&self, ticket: &Ticket, archive: &Utf8Path) -> Result<Utf8PathBuf, StplugError> {
        let id = ticket.id();
        let prepared = self.installer.prepare(archive, id, ticket.token())?;
        self.update(ticket, |status| status.status = Some(DownloadPhase::Installing));
        self.installer.write(&prepared, id, ticket.token())
    }

    /// Records the install once the name is known. A cancellation seen here
    /// rolls the script back so a cancelled record never leaves one behind.
    fn finish(
        &self,
        ticket: &Ticket,
        path: Utf8PathBuf,
        source: &str,
    ) -> Result<(), StplugError> {
        let id = ticket.id();
        let name = self
            .names
            .resolve(id)
            .unwrap_or_else(|| format!("UNKNOWN ({id})"));
        if let Err(err) = ticket.token().check() {
            self.installer.uninstall(&path);
            return Err(err);
        }
        if let Err(err) = self.roster.upsert(id, &name) {
            warn!("failed to record {id} in roster: {err}");
        }
        if let Err(err) = self.roster.log_event(&format!("ADDED - {source}"), id, &name) {
            warn!("failed to append event log: {err}");
        }
        let applied = self.update(ticket, |status| {
            status.status = Some(DownloadPhase::Done);
            status.success = true;
            status.installed_path = Some(path.clone());
            status.api_used = Some(source.to_string());
        });
        if applied {
            info!("installed {id} from {source} -> {path}");
        }
        Ok(())
    }

    pub fn has_script(&self, id: ResourceId) -> Result<bool, StplugError> {
        Ok(self.store.script_path(id)?.as_std_path().exists()
            || self.store.disabled_script_path(id)?.as_std_path().exists())
    }

    /// Deletes the script (enabled or disabled) and its roster line. Returns
    /// the paths that were removed.
    pub fn remove_script(&self, id: ResourceId) -> Result<Vec<Utf8PathBuf>, StplugError> {
        let mut removed = Vec::new();
        for path in [self.store.script_path(id)?, self.store.disabled_script_path(id)?] {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(StplugError::Filesystem(format!("remove {path}: {err}"))),
            }
        }
        let name = self
            .roster
            .name_of(id)
            .or_else(|| self.names.cached(id))
            .unwrap_or_else(|| format!("UNKNOWN ({id})"));
        if let Err(err) = self.roster.remove(id) {
            warn!("failed to update roster for {id}: {err}");
        }
        if !removed.is_empty() {
            if let Err(err) = self.roster.log_event("REMOVED", id, &name) {
                warn!("failed to append event log: {err}");
            }
            info!("removed script for {id}");
        }
        Ok(removed)
    }

    pub fn installed_scripts(&self) -> Result<Vec<InstalledScript>, StplugError> {
        let dir = self.store.plugin_dir()?;
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StplugError::Filesystem(format!("read {dir}: {err}"))),
        };

        let mut scripts = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let (stem, disabled) = match file_name.strip_suffix(".lua.disabled") {
                Some(stem) => (stem, true),
                None => match file_name.strip_suffix(".lua") {
                    Some(stem) => (stem, false),
                    None => continue,
                },
            };
            let Ok(id) = stem.parse::<ResourceId>() else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("failed to stat {file_name}: {err}");
                    continue;
                }
            };
            let modified = metadata
                .modified()
                .map(|time| DateTime::<Local>::from(time).format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_default();
            scripts.push(InstalledScript {
                id,
                name: self
                    .names
                    .cached(id)
                    .unwrap_or_else(|| format!("Unknown Game ({id})")),
                file_name: file_name.to_string(),
                disabled,
                size: metadata.len(),
                modified,
                path: dir.join(file_name),
            });
        }
        scripts.sort_by(|a, b| a.id.cmp(&b.id).then(a.disabled.cmp(&b.disabled)));
        Ok(scripts)
    }

    pub fn roster_entries(&self) -> Result<Vec<RosterEntry>, StplugError> {
        self.roster.entries()
    }

    pub fn dismiss_roster(&self) -> Result<(), StplugError> {
        self.roster.dismiss()
    }
}
