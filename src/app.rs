use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::domain::{FixKind, ResourceId};
use crate::downloads::{DownloadOrchestrator, InstalledScript};
use crate::error::StplugError;
use crate::fixes::{FixAvailability, FixManager, FixRequest, InstalledFix};
use crate::http::{HttpSource, ReqwestSource};
use crate::library::{InstallLocator, SteamLibrary};
use crate::manifest::{ManifestFile, SourceDescriptor};
use crate::names::{CachedNameResolver, NameResolver};
use crate::roster::{InstalledRoster, RosterEntry};
use crate::status::{
    Accepted, CancelOutcome, DownloadStatus, FixStatus, StatusRecord, StatusStore, UnfixStatus,
};
use crate::store::Store;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct ScriptList {
    pub scripts: Vec<InstalledScript>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub id: ResourceId,
    pub removed: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixList {
    pub fixes: Vec<InstalledFix>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceList {
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// The operation surface: script downloads, fixes and their status.
#[derive(Clone)]
pub struct App {
    downloads: DownloadOrchestrator,
    fixes: FixManager,
}

impl App {
    pub fn new(downloads: DownloadOrchestrator, fixes: FixManager) -> Self {
        Self { downloads, fixes }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, StplugError> {
        let http: Arc<dyn HttpSource> = Arc::new(ReqwestSource::new(&config.http)?);
        let locator: Arc<dyn InstallLocator> =
            Arc::new(SteamLibrary::new(config.steam_path.clone()));
        Ok(Self::with_components(config, http, locator))
    }

    /// Wires every component from `config`, with the network and library
    /// seams supplied by the caller.
    pub fn with_components(
        config: &ResolvedConfig,
        http: Arc<dyn HttpSource>,
        locator: Arc<dyn InstallLocator>,
    ) -> Self {
        let store = Store::new(config);
        let statuses = Arc::new(StatusStore::new());

        let mut resolver =
            CachedNameResolver::new(InstalledRoster::new(&store), store.applist_path());
        if let Some(url) = &config.name_lookup_url {
            resolver = resolver.with_remote(http.clone(), url.clone());
        }
        let names: Arc<dyn NameResolver> = Arc::new(resolver);

        let downloads = DownloadOrchestrator::new(
            statuses.clone(),
            http.clone(),
            Arc::new(ManifestFile::new(config.sources_file.clone())),
            names.clone(),
            store.clone(),
            config.http.timeout,
        );
        let fixes = FixManager::new(
            statuses,
            http,
            locator,
            names,
            store,
            config.fixes.clone(),
            config.http.clone(),
        );
        Self::new(downloads, fixes)
    }

    pub fn start_download(&self, id: ResourceId) -> Result<Accepted, StplugError> {
        self.downloads.start(id)
    }

    pub fn poll_download(&self, id: ResourceId) -> DownloadStatus {
        self.downloads.poll(id)
    }

    pub fn cancel_download(&self, id: ResourceId) -> CancelOutcome {
        self.downloads.cancel(id)
    }

    pub fn check_fix_availability(&self, id: ResourceId) -> FixAvailability {
        self.fixes.check_availability(id)
    }

    pub fn apply_fix(
        &self,
        id: ResourceId,
        url: &str,
        install_path: Utf8PathBuf,
        kind: FixKind,
        game_name: Option<String>,
    ) -> Result<Accepted, StplugError> {
        self.fixes.apply_fix(FixRequest {
            id,
            url: url.to_string(),
            install_path,
            kind,
            game_name,
        })
    }

    pub fn poll_fix(&self, id: ResourceId) -> FixStatus {
        self.fixes.poll_fix(id)
    }

    pub fn cancel_fix(&self, id: ResourceId) -> CancelOutcome {
        self.fixes.cancel_fix(id)
    }

    pub fn unfix(
        &self,
        id: ResourceId,
        install_path: Option<Utf8PathBuf>,
        fix_date: Option<String>,
    ) -> Result<Accepted, StplugError> {
        self.fixes.unfix(id, install_path, fix_date)
    }

    pub fn poll_unfix(&self, id: ResourceId) -> UnfixStatus {
        self.fixes.poll_unfix(id)
    }

    pub fn list_installed_fixes(&self) -> Result<FixList, StplugError> {
        Ok(FixList {
            fixes: self.fixes.list_installed_fixes()?,
        })
    }

    pub fn has_script(&self, id: ResourceId) -> Result<bool, StplugError> {
        self.downloads.has_script(id)
    }

    pub fn remove_script(&self, id: ResourceId) -> Result<RemoveResult, StplugError> {
        Ok(RemoveResult {
            id,
            removed: self.downloads.remove_script(id)?,
        })
    }

    pub fn installed_scripts(&self) -> Result<ScriptList, StplugError> {
        Ok(ScriptList {
            scripts: self.downloads.installed_scripts()?,
        })
    }

    pub fn roster_entries(&self) -> Result<Vec<RosterEntry>, StplugError> {
        self.downloads.roster_entries()
    }

    pub fn dismiss_roster(&self) -> Result<(), StplugError> {
        self.downloads.dismiss_roster()
    }

    pub fn sources(&self) -> Result<SourceList, StplugError> {
        Ok(SourceList {
            sources: self.downloads.sources()?,
        })
    }

    pub fn wait_for_download(&self, id: ResourceId, sink: &dyn ProgressSink) -> DownloadStatus {
        wait_for_terminal(|| self.poll_download(id), describe_download, sink)
    }

    pub fn wait_for_fix(&self, id: ResourceId, sink: &dyn ProgressSink) -> FixStatus {
        wait_for_terminal(|| self.poll_fix(id), describe_fix, sink)
    }

    pub fn wait_for_unfix(&self, id: ResourceId, sink: &dyn ProgressSink) -> UnfixStatus {
        wait_for_terminal(
            || self.poll_unfix(id),
            |status: &UnfixStatus| status.progress.clone(),
            sink,
        )
    }
}

/// Polls until the record is terminal, emitting an event whenever the
/// description changes. An empty record (never started) returns at once.
fn wait_for_terminal<T: StatusRecord>(
    poll: impl Fn() -> T,
    describe: impl Fn(&T) -> String,
    sink: &dyn ProgressSink,
) -> T {
    let started = Instant::now();
    let mut last = String::new();
    loop {
        let status = poll();
        let message = describe(&status);
        if !message.is_empty() && message != last {
            sink.event(ProgressEvent {
                message: message.clone(),
                elapsed: Some(started.elapsed()),
            });
            last = message;
        }
        if !status.is_active() {
            return status;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn describe_download(status: &DownloadStatus) -> String {
    let Some(phase) = status.status else {
        return String::new();
    };
    let source = status.current_source.as_deref().unwrap_or("-");
    match status.total_bytes {
        0 if status.bytes_read == 0 => format!("{phase:?} ({source})"),
        0 => format!("{phase:?} ({source}) {} bytes", status.bytes_read),
        total => format!("{phase:?} ({source}) {}/{total} bytes", status.bytes_read),
    }
}

fn describe_fix(status: &FixStatus) -> String {
    let Some(phase) = status.status else {
        return String::new();
    };
    if status.total_bytes > 0 {
        format!("{phase:?} {}/{} bytes", status.bytes_read, status.total_bytes)
    } else {
        format!("{phase:?}")
    }
}
