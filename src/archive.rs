use std::fs::{self, File};
use std::io::{self, Read};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::cancel::CancelToken;
use crate::domain::ResourceId;
use crate::error::StplugError;
use crate::store::{Store, remove_with_retry};

/// Local file header, empty archive, spanned archive.
pub const ZIP_SIGNATURES: [[u8; 4]; 3] = [
    [b'P', b'K', 0x03, 0x04],
    [b'P', b'K', 0x05, 0x06],
    [b'P', b'K', 0x07, 0x08],
];

static SCRIPT_ENTRY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\.lua$").unwrap());
static MANIFEST_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*setManifestid\(").unwrap());
static COMMENTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*--").unwrap());

pub fn has_zip_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && ZIP_SIGNATURES.iter().any(|sig| bytes[..4] == sig[..])
}

/// Reads the first four bytes of `path` and rejects anything that is not a
/// zip archive.
pub fn check_signature(path: &Utf8Path) -> Result<(), StplugError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| StplugError::Filesystem(format!("open {path}: {err}")))?;
    let mut magic = Vec::with_capacity(4);
    file.by_ref()
        .take(4)
        .read_to_end(&mut magic)
        .map_err(|err| StplugError::Filesystem(err.to_string()))?;
    if has_zip_signature(&magic) {
        return Ok(());
    }
    let magic = magic.iter().map(|byte| format!("{byte:02x}")).collect::<String>();
    Err(StplugError::InvalidArchive { magic })
}

fn basename(entry: &str) -> &str {
    entry.rsplit(['/', '\\']).next().unwrap_or(entry)
}

/// Picks the script to install: `<id>.lua` when present, else the first
/// `<digits>.lua` entry.
pub fn select_script_entry(names: &[String], id: ResourceId) -> Option<String> {
    let preferred = format!("{id}.lua");
    let candidates = names
        .iter()
        .filter(|name| SCRIPT_ENTRY.is_match(basename(name)))
        .collect::<Vec<_>>();
    candidates
        .iter()
        .find(|name| basename(name) == preferred)
        .or_else(|| candidates.first())
        .map(|name| name.to_string())
}

/// Comments out every live `setManifestid(` call. Already commented lines are
/// left alone, so applying this twice is the same as applying it once.
pub fn disable_manifest_directives(text: &str) -> String {
    let mut output = String::with_capacity(text.len() + 16);
    for line in text.split_inclusive('\n') {
        if MANIFEST_DIRECTIVE.is_match(line) && !COMMENTED.is_match(line) {
            let indent = line.len() - line.trim_start().len();
            output.push_str(&line[..indent]);
            output.push_str("--");
            output.push_str(&line[indent..]);
        } else {
            output.push_str(line);
        }
    }
    output
}

pub fn placeholder_script(id: ResourceId) -> String {
    format!(
        "-- Basic Lua file for appid {id}\n\
         -- Generated by stplug because no configured source offered this app\n\
         \n\
         setAppID({id})\n\
         -- setManifestid() is left commented out, as in processed scripts\n\
         \n\
         -- Replace this file once a source provides the full script.\n"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedScript {
    pub entry: String,
    pub text: String,
}

/// Turns a validated archive into an installed `<id>.lua`.
#[derive(Debug, Clone)]
pub struct ArchiveInstaller {
    store: Store,
}

impl ArchiveInstaller {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Extracts side manifests, selects the script entry and applies the
    /// directive transform. Nothing is written to the plug-in directory yet.
    pub fn prepare(
        &self,
        archive_path: &Utf8Path,
        id: ResourceId,
        token: &CancelToken,
    ) -> Result<PreparedScript, StplugError> {
        token.check()?;
        let file = File::open(archive_path.as_std_path()).map_err(|err| {
            StplugError::Filesystem(format!("open zip {archive_path}: {err}"))
        })?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| StplugError::Archive(err.to_string()))?;
        let names = archive.file_names().map(str::to_string).collect::<Vec<_>>();

        self.extract_manifests(&mut archive, &names, token)?;
        token.check()?;

        let entry = select_script_entry(&names, id).ok_or(StplugError::NoScriptEntry)?;
        let mut bytes = Vec::new();
        archive
            .by_name(&entry)
            .map_err(|err| StplugError::Archive(err.to_string()))?
            .read_to_end(&mut bytes)
            .map_err(|err| StplugError::Archive(err.to_string()))?;
        let text = String::from_utf8(bytes)
            .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned());

        debug!("selected {entry} for {id}");
        Ok(PreparedScript {
            entry,
            text: disable_manifest_directives(&text),
        })
    }

    /// Writes the prepared script to its canonical location.
    pub fn write(
        &self,
        script: &PreparedScript,
        id: ResourceId,
        token: &CancelToken,
    ) -> Result<Utf8PathBuf, StplugError> {
        let destination = self.store.script_path(id)?;
        token.check()?;
        Store::write_text_atomic(&destination, &script.text)?;
        info!("installed script -> {destination}");
        Ok(destination)
    }

    pub fn write_placeholder(
        &self,
        id: ResourceId,
        token: &CancelToken,
    ) -> Result<Utf8PathBuf, StplugError> {
        let script = PreparedScript {
            entry: String::new(),
            text: placeholder_script(id),
        };
        self.write(&script, id, token)
    }

    pub fn discard(&self, archive_path: &Utf8Path) {
        remove_with_retry(archive_path);
    }

    /// Removes a script written by a run that was cancelled afterwards.
    pub fn uninstall(&self, script_path: &Utf8Path) {
        if remove_with_retry(script_path) {
            debug!("rolled back {script_path}");
        }
    }

    /// Best effort: only cancellation is returned, every other failure is
    /// logged and skipped.
    fn extract_manifests(
        &self,
        archive: &mut ZipArchive<File>,
        names: &[String],
        token: &CancelToken,
    ) -> Result<(), StplugError> {
        let manifests = names
            .iter()
            .filter(|name| name.to_lowercase().ends_with(".manifest"))
            .collect::<Vec<_>>();
        if manifests.is_empty() {
            return Ok(());
        }
        let depotcache = match self.store.depotcache_dir() {
            Ok(dir) => dir,
            Err(err) => {
                warn!("skipping manifest extraction: {err}");
                return Ok(());
            }
        };
        if let Err(err) = fs::create_dir_all(depotcache.as_std_path()) {
            warn!("depotcache extraction failed: {err}");
            return Ok(());
        }
        for name in manifests {
            token.check()?;
            let pure = basename(name);
            if pure.is_empty() {
                continue;
            }
            let target = depotcache.join(pure);
            let result = archive
                .by_name(name)
                .map_err(io::Error::other)
                .and_then(|mut entry| {
                    let mut out = File::create(target.as_std_path())?;
                    io::copy(&mut entry, &mut out)
                });
            match result {
                Ok(_) => debug!("extracted manifest -> {target}"),
                Err(err) => warn!("failed to extract manifest {name}: {err}"),
            }
        }
        Ok(())
    }
}
