use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{FixEndpoints, HttpSettings};
use crate::domain::{FixKind, ResourceId};
use crate::error::{StplugError, fs_err};
use crate::fixlog::{FixRecord, append_block, parse_records, plan_removal};
use crate::fs_util::{extract_zip, safe_join};
use crate::http::HttpSource;
use crate::library::InstallLocator;
use crate::names::NameResolver;
use crate::roster::TIMESTAMP_FORMAT;
use crate::status::{
    Accepted, CANCELLED_BY_USER, CancelOutcome, FixPhase, FixStatus, StatusStore, Ticket,
    UnfixPhase, UnfixStatus,
};
use crate::store::{Store, remove_with_retry};
use crate::stream::stream_to_file;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixProbe {
    pub status: u16,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAvailability {
    pub appid: ResourceId,
    pub game_name: String,
    pub generic_fix: FixProbe,
    pub online_fix: FixProbe,
}

#[derive(Debug, Clone)]
pub struct FixRequest {
    pub id: ResourceId,
    pub url: String,
    pub install_path: Utf8PathBuf,
    pub kind: FixKind,
    pub game_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledFix {
    pub appid: ResourceId,
    pub game_name: String,
    pub install_path: Utf8PathBuf,
    pub files_count: usize,
    #[serde(flatten)]
    pub record: FixRecord,
}

type DirLocks = Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>;

/// Probes, applies and reverts fix archives. Every apply appends a block to
/// the install directory's transaction log; unfix replays that log backwards.
#[derive(Clone)]
pub struct FixManager {
    statuses: Arc<StatusStore>,
    http: Arc<dyn HttpSource>,
    locator: Arc<dyn InstallLocator>,
    names: Arc<dyn NameResolver>,
    store: Store,
    endpoints: FixEndpoints,
    settings: HttpSettings,
    dir_locks: Arc<DirLocks>,
}

impl FixManager {
    pub fn new(
        statuses: Arc<StatusStore>,
        http: Arc<dyn HttpSource>,
        locator: Arc<dyn InstallLocator>,
        names: Arc<dyn NameResolver>,
        store: Store,
        endpoints: FixEndpoints,
        settings: HttpSettings,
    ) -> Self {
        Self {
            statuses,
            http,
            locator,
            names,
            store,
            endpoints,
            settings,
            dir_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn unknown_game(id: ResourceId) -> String {
        format!("Unknown Game ({id})")
    }

    pub fn check_availability(&self, id: ResourceId) -> FixAvailability {
        let game_name = self
            .names
            .resolve(id)
            .unwrap_or_else(|| Self::unknown_game(id));
        FixAvailability {
            appid: id,
            game_name,
            generic_fix: self.probe(id, &self.endpoints.generic, "generic"),
            online_fix: self.probe(id, &self.endpoints.online, "online"),
        }
    }

    fn probe(&self, id: ResourceId, template: &str, label: &str) -> FixProbe {
        let url = id.substitute(template);
        match self.http.head(&url, self.settings.probe_timeout) {
            Ok(status) => {
                info!("{label} fix check for {id} -> {status}");
                let available = status == 200;
                FixProbe {
                    status,
                    available,
                    url: available.then_some(url),
                }
            }
            Err(err) => {
                warn!("{label} fix check failed for {id}: {err}");
                FixProbe::default()
            }
        }
    }

    fn dir_lock(&self, install_path: &Utf8Path) -> Arc<Mutex<()>> {
        let key = install_path
            .canonicalize_utf8()
            .unwrap_or_else(|_| install_path.to_path_buf());
        self.dir_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn apply_fix(&self, request: FixRequest) -> Result<Accepted, StplugError> {
        let id = request.id;
        if request.url.trim().is_empty() {
            return Err(StplugError::MissingUrl);
        }
        if !request.install_path.as_std_path().is_dir() {
            return Err(StplugError::MissingInstallPath(request.install_path));
        }
        let ticket = self.statuses.fixes.begin(id, FixStatus::queued())?;
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("fix-{id}"))
            .spawn(move || worker.run_apply(ticket, request));
        if let Err(err) = spawned {
            self.statuses.fixes.merge(id, |status| {
                status.status = Some(FixPhase::Failed);
                status.error = Some(format!("Failed to start worker: {err}"));
            });
            return Err(StplugError::Filesystem(err.to_string()));
        }
        Ok(Accepted { id })
    }

    pub fn poll_fix(&self, id: ResourceId) -> FixStatus {
        self.statuses.fixes.get(id)
    }

    pub fn cancel_fix(&self, id: ResourceId) -> CancelOutcome {
        self.statuses.fixes.cancel(id, |status| {
            status.status = Some(FixPhase::Cancelled);
            status.error = Some(CANCELLED_BY_USER.to_string());
        })
    }

    fn run_apply(&self, ticket: Ticket, request: FixRequest) {
        let id = ticket.id();
        match self.apply(&ticket, &request) {
            Ok(count) => {
                info!("{} applied to {}", request.kind, request.install_path);
                self.statuses.fixes.update(&ticket, |status| {
                    status.status = Some(FixPhase::Done);
                    status.success = true;
                    status.files_extracted = count;
                });
            }
            Err(err) if err.is_cancelled() => info!("fix for {id} stopped after cancellation"),
            Err(err) => {
                warn!("fix for {id} failed: {err}");
                self.statuses.fixes.update(&ticket, |status| {
                    status.status = Some(FixPhase::Failed);
                    status.error = Some(err.to_string());
                });
            }
        }
    }

    fn apply(&self, ticket: &Ticket, request: &FixRequest) -> Result<usize, StplugError> {
        let id = ticket.id();
        let token = ticket.token();
        token.check()?;
        self.statuses.fixes.update(ticket, |status| {
            status.status = Some(FixPhase::Downloading);
            status.bytes_read = 0;
            status.total_bytes = 0;
        });

        info!("downloading {} from {}", request.kind, request.url);
        let response = self.http.get(&request.url, self.settings.fix_timeout)?;
        if !response.is_success() {
            return Err(StplugError::HttpStatus {
                status: response.status,
                url: request.url.clone(),
            });
        }
        let temp = self.store.reserve_temp_file(&format!("fix-{id}-"))?;
        self.statuses.fixes.update(ticket, |status| {
            status.total_bytes = response.content_length.unwrap_or(0);
        });

        let mut body = response.body;
        let streamed = stream_to_file(body.as_mut(), &temp, token, |count| {
            self.statuses
                .fixes
                .update(ticket, |status| status.bytes_read = count);
        });
        if let Err(err) = streamed {
            remove_with_retry(&temp);
            return Err(err);
        }

        self.statuses
            .fixes
            .update(ticket, |status| status.status = Some(FixPhase::Extracting));
        let lock = self.dir_lock(&request.install_path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut files = Vec::new();
        let extracted = extract_zip(
            &temp,
            &request.install_path,
            &id.to_string(),
            token,
            &mut files,
        );
        remove_with_retry(&temp);
        let extracted = extracted.and_then(|()| token.check());
        if extracted.is_ok() && request.kind.needs_appid_substitution() {
            substitute_unsteam_ini(&request.install_path, &files, id);
        }

        // Anything already on disk is logged, even after a failure, so it
        // can be reverted.
        if extracted.is_ok() || !files.is_empty() {
            let record = FixRecord {
                date: Local::now().format(TIMESTAMP_FORMAT).to_string(),
                game: request
                    .game_name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| Self::unknown_game(id)),
                fix_type: request.kind.label().to_string(),
                download_url: request.url.clone(),
                files: files.clone(),
            };
            if let Err(err) = append_log(&request.install_path, id, &record) {
                warn!("failed to write fix log: {err}");
            }
        }
        extracted?;
        Ok(files.len())
    }

    pub fn unfix(
        &self,
        id: ResourceId,
        install_path: Option<Utf8PathBuf>,
        fix_date: Option<String>,
    ) -> Result<Accepted, StplugError> {
        let install_path = match install_path {
            Some(path) => path,
            None => self.locator.install_path(id)?,
        };
        if !install_path.as_std_path().is_dir() {
            return Err(StplugError::MissingInstallPath(install_path));
        }
        let log_path = Store::fix_log_path(&install_path, id);
        if !log_path.as_std_path().exists() {
            return Err(StplugError::NoFixLog(install_path));
        }
        let fix_date = fix_date.filter(|date| !date.trim().is_empty());

        let ticket = self.statuses.unfixes.begin(id, UnfixStatus::queued())?;
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("unfix-{id}"))
            .spawn(move || worker.run_unfix(ticket, install_path, fix_date));
        if let Err(err) = spawned {
            self.statuses.unfixes.merge(id, |status| {
                status.status = Some(UnfixPhase::Failed);
                status.error = Some(format!("Failed to start worker: {err}"));
            });
            return Err(StplugError::Filesystem(err.to_string()));
        }
        Ok(Accepted { id })
    }

    pub fn poll_unfix(&self, id: ResourceId) -> UnfixStatus {
        self.statuses.unfixes.get(id)
    }

    fn run_unfix(&self, ticket: Ticket, install_path: Utf8PathBuf, fix_date: Option<String>) {
        let id = ticket.id();
        match self.remove_fix(&ticket, &install_path, fix_date.as_deref()) {
            Ok(removed) => {
                info!("un-fix for {id} removed {removed} files");
                self.statuses.unfixes.update(&ticket, |status| {
                    status.status = Some(UnfixPhase::Done);
                    status.success = true;
                    status.files_removed = removed;
                    status.progress = format!("Removed {removed} files");
                });
            }
            Err(err) => {
                warn!("un-fix for {id} failed: {err}");
                self.statuses.unfixes.update(&ticket, |status| {
                    status.status = Some(UnfixPhase::Failed);
                    status.error = Some(err.to_string());
                });
            }
        }
    }

    fn remove_fix(
        &self,
        ticket: &Ticket,
        install_path: &Utf8Path,
        fix_date: Option<&str>,
    ) -> Result<usize, StplugError> {
        let id = ticket.id();
        let lock = self.dir_lock(install_path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.statuses.unfixes.update(ticket, |status| {
            status.status = Some(UnfixPhase::Removing);
            status.progress = "Reading fix log...".to_string();
        });
        let log_path = Store::fix_log_path(install_path, id);
        let text = fs::read_to_string(log_path.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("read {log_path}: {err}")))?;
        let plan = plan_removal(&text, fix_date);
        info!("{} files to remove for {id}", plan.files.len());
        self.statuses.unfixes.update(ticket, |status| {
            status.progress = format!("Removing {} files...", plan.files.len());
        });

        let mut removed = 0;
        for file in &plan.files {
            let Some(target) = safe_join(install_path, file) else {
                warn!("refusing to delete {file}: path leaves the install directory");
                continue;
            };
            match fs::remove_file(target.as_std_path()) {
                Ok(()) => {
                    removed += 1;
                    debug!("deleted {file}");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to delete {file}: {err}"),
            }
        }

        match plan.rewritten_log() {
            Some(content) => {
                Store::write_text_atomic(&log_path, &content)?;
                info!("updated fix log, {} fixes remaining", plan.retained.len());
            }
            None => {
                remove_with_retry(&log_path);
            }
        }
        Ok(removed)
    }

    /// Every well-formed fix record found in installed apps' directories.
    pub fn list_installed_fixes(&self) -> Result<Vec<InstalledFix>, StplugError> {
        let mut fixes = Vec::new();
        for app in self.locator.installed_apps()? {
            let log_path = Store::fix_log_path(&app.install_path, app.id);
            let text = match fs::read_to_string(log_path.as_std_path()) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!("failed to read {log_path}: {err}");
                    continue;
                }
            };
            let placeholder = Self::unknown_game(app.id);
            for record in parse_records(&text) {
                let game_name = if record.game.is_empty() || record.game == placeholder {
                    app.name.clone()
                } else {
                    record.game.clone()
                };
                fixes.push(InstalledFix {
                    appid: app.id,
                    game_name,
                    install_path: app.install_path.clone(),
                    files_count: record.files.len(),
                    record,
                });
            }
        }
        Ok(fixes)
    }
}

fn append_log(install_path: &Utf8Path, id: ResourceId, record: &FixRecord) -> Result<(), StplugError> {
    let log_path = Store::fix_log_path(install_path, id);
    let existing = match fs::read_to_string(log_path.as_std_path()) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(fs_err(err)),
    };
    Store::write_text_atomic(&log_path, &append_block(&existing, record))?;
    info!(
        "appended fix log at {log_path} with {} files",
        record.files.len()
    );
    Ok(())
}

/// Replaces `<appid>` in the first extracted `unsteam.ini`, writing only when
/// the content changes.
fn substitute_unsteam_ini(install_path: &Utf8Path, files: &[String], id: ResourceId) {
    let Some(relative) = files
        .iter()
        .find(|file| file.to_lowercase().ends_with("unsteam.ini"))
    else {
        warn!("extracted files do not include unsteam.ini");
        return;
    };
    let Some(path) = safe_join(install_path, relative) else {
        return;
    };
    let contents = match fs::read(path.as_std_path()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!("failed to read {path}: {err}");
            return;
        }
    };
    let updated = id.substitute(&contents);
    if updated == contents {
        debug!("{path} has no <appid> placeholder");
        return;
    }
    match fs::write(path.as_std_path(), updated) {
        Ok(()) => info!("updated {path} with appid {id}"),
        Err(err) => warn!("failed to update {path}: {err}"),
    }
}
