use std::fs::{self, File};
use std::io;
use std::path::Component;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use zip::ZipArchive;

use crate::cancel::CancelToken;
use crate::error::StplugError;

struct PlannedEntry {
    index: usize,
    is_dir: bool,
    parts: Vec<String>,
}

/// Extracts every entry of `zip_path` below `target_dir`. If all entries sit
/// under a single top-level folder named `wrapper`, that folder is stripped.
///
/// Relative paths (`/` separated) of written files are pushed to `written`
/// as they land, so the caller still sees them when extraction stops early.
pub fn extract_zip(
    zip_path: &Utf8Path,
    target_dir: &Utf8Path,
    wrapper: &str,
    token: &CancelToken,
    written: &mut Vec<String>,
) -> Result<(), StplugError> {
    let file = File::open(zip_path.as_std_path())
        .map_err(|err| StplugError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| StplugError::Archive(err.to_string()))?;

    let mut planned = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|err| StplugError::Archive(err.to_string()))?;
        let Some(path) = entry.enclosed_name() else {
            return Err(StplugError::UnsafeEntry(entry.name().to_string()));
        };
        let parts = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>();
        planned.push(PlannedEntry {
            index,
            is_dir: entry.is_dir(),
            parts,
        });
    }

    let strip = !planned.is_empty()
        && planned
            .iter()
            .all(|entry| entry.parts.first().is_some_and(|root| root == wrapper));
    token.check()?;

    for entry in planned {
        let relative = if strip {
            &entry.parts[1..]
        } else {
            &entry.parts[..]
        };
        if relative.is_empty() {
            continue;
        }
        let relative = relative.join("/");
        let target = target_dir.join(&relative);

        if entry.is_dir {
            fs::create_dir_all(target.as_std_path())
                .map_err(|err| StplugError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        }
        let mut source = archive
            .by_index(entry.index)
            .map_err(|err| StplugError::Archive(err.to_string()))?;
        let mut outfile = File::create(target.as_std_path())
            .map_err(|err| StplugError::Filesystem(format!("create {target}: {err}")))?;
        io::copy(&mut source, &mut outfile)
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        written.push(relative);
        token.check()?;
    }
    Ok(())
}

/// Joins a logged relative path onto `root`, refusing anything that could
/// climb out of it.
pub fn safe_join(root: &Utf8Path, relative: &str) -> Option<Utf8PathBuf> {
    let mut joined = root.to_path_buf();
    let mut pushed = false;
    for component in Utf8Path::new(relative).components() {
        match component {
            Utf8Component::Normal(part) => {
                joined.push(part);
                pushed = true;
            }
            Utf8Component::CurDir => {}
            _ => return None,
        }
    }
    pushed.then_some(joined)
}
