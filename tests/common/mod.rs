#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use stplug::app::App;
use stplug::config::{FixEndpoints, HttpSettings, ResolvedConfig};
use stplug::domain::ResourceId;
use stplug::error::StplugError;
use stplug::http::{HttpResponse, HttpSource};
use stplug::library::{InstallLocator, InstalledApp};

pub const GENERIC_FIX: &str = "https://fixes.test/generic/<appid>.zip";
pub const ONLINE_FIX: &str = "https://fixes.test/online/<appid>.zip";

/// In-memory HTTP: fixed replies per URL, optional gates that hold a body
/// until the test releases it, and a record of every requested URL.
#[derive(Default)]
pub struct MockHttp {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    gates: Mutex<HashMap<String, Receiver<()>>>,
    resets: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<String>>,
}

impl MockHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, status: u16, body: Vec<u8>) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body));
    }

    /// The body for `url` blocks on its first read until the returned
    /// sender fires (or is dropped).
    pub fn gate(&self, url: &str) -> Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gates.lock().unwrap().insert(url.to_string(), rx);
        tx
    }

    /// The body for `url` delivers `after` bytes, then fails with a
    /// connection reset.
    pub fn reset_after(&self, url: &str, after: usize) {
        self.resets.lock().unwrap().insert(url.to_string(), after);
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

struct GatedBody {
    gate: Option<Receiver<()>>,
    inner: Cursor<Vec<u8>>,
    reset_after: Option<usize>,
}

impl Read for GatedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        let Some(limit) = self.reset_after else {
            return self.inner.read(buf);
        };
        let position = self.inner.position() as usize;
        if position >= limit {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        let cap = (limit - position).min(buf.len());
        self.inner.read(&mut buf[..cap])
    }
}

impl HttpSource for MockHttp {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, StplugError> {
        self.requests.lock().unwrap().push(url.to_string());
        let Some((status, body)) = self.routes.lock().unwrap().get(url).cloned() else {
            return Err(StplugError::Http(format!("connection refused: {url}")));
        };
        let gate = self.gates.lock().unwrap().remove(url);
        let reset_after = self.resets.lock().unwrap().get(url).copied();
        Ok(HttpResponse {
            status,
            content_length: Some(body.len() as u64),
            body: Box::new(GatedBody {
                gate,
                inner: Cursor::new(body),
                reset_after,
            }),
        })
    }

    fn head(&self, url: &str, _timeout: Duration) -> Result<u16, StplugError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .map(|(status, _)| *status)
            .ok_or_else(|| StplugError::Http(format!("connection refused: {url}")))
    }
}

#[derive(Default)]
pub struct StaticLocator {
    pub apps: Vec<InstalledApp>,
}

impl InstallLocator for StaticLocator {
    fn install_path(&self, id: ResourceId) -> Result<Utf8PathBuf, StplugError> {
        self.apps
            .iter()
            .find(|app| app.id == id)
            .map(|app| app.install_path.clone())
            .ok_or_else(|| StplugError::InstallNotFound(format!("{id} is not installed")))
    }

    fn installed_apps(&self) -> Result<Vec<InstalledApp>, StplugError> {
        Ok(self.apps.clone())
    }
}

pub struct Fixture {
    pub temp: TempDir,
    pub root: Utf8PathBuf,
    pub config: ResolvedConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let data_dir = root.join("data");
        let config = ResolvedConfig {
            sources_file: data_dir.join("api.json"),
            data_dir,
            steam_path: Some(root.join("steam")),
            http: HttpSettings::default(),
            fixes: FixEndpoints {
                generic: GENERIC_FIX.to_string(),
                online: ONLINE_FIX.to_string(),
            },
            name_lookup_url: None,
        };
        Self { temp, root, config }
    }

    pub fn write_sources(&self, sources: &[(&str, &str)]) {
        let list = sources
            .iter()
            .map(|(name, url)| format!(r#"{{"name": "{name}", "url": "{url}", "enabled": true}}"#))
            .collect::<Vec<_>>()
            .join(",\n");
        std::fs::create_dir_all(self.config.data_dir.as_std_path()).unwrap();
        std::fs::write(
            self.config.sources_file.as_std_path(),
            format!("{{\"api_list\": [\n{list}\n]}}"),
        )
        .unwrap();
    }

    pub fn app(&self, http: Arc<MockHttp>) -> App {
        self.app_with_locator(http, StaticLocator::default())
    }

    pub fn app_with_locator(&self, http: Arc<MockHttp>, locator: StaticLocator) -> App {
        App::with_components(&self.config, http, Arc::new(locator))
    }

    pub fn plugin_dir(&self) -> Utf8PathBuf {
        self.root.join("steam").join("config").join("stplug-in")
    }

    pub fn game_dir(&self, name: &str) -> Utf8PathBuf {
        let dir = self.root.join("games").join(name);
        std::fs::create_dir_all(dir.as_std_path()).unwrap();
        dir
    }
}

pub fn id(value: u32) -> ResourceId {
    ResourceId::new(value).unwrap()
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .unwrap();
            continue;
        }
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Polls until `done` holds or ten seconds pass, returning the last value.
pub fn wait_until<T>(mut poll: impl FnMut() -> T, done: impl Fn(&T) -> bool) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let value = poll();
        if done(&value) || Instant::now() > deadline {
            return value;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn read(path: &Utf8Path) -> String {
    std::fs::read_to_string(path.as_std_path()).unwrap()
}

pub fn temp_files(dir: &Utf8Path) -> Vec<String> {
    match std::fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}
