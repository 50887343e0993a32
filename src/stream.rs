use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};

use camino::Utf8Path;

use crate::cancel::CancelToken;
use crate::error::StplugError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Copies `body` into `destination` chunk by chunk, reporting the running
/// byte count after every chunk. Cancellation is checked before and after
/// each chunk is written and once more after the stream ends.
pub fn stream_to_file(
    body: &mut dyn Read,
    destination: &Utf8Path,
    token: &CancelToken,
    mut on_chunk: impl FnMut(u64),
) -> Result<u64, StplugError> {
    let file = File::create(destination.as_std_path())
        .map_err(|err| StplugError::Filesystem(format!("create {destination}: {err}")))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let read = match body.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StplugError::Http(err.to_string())),
        };
        token.check()?;
        writer
            .write_all(&buffer[..read])
            .map_err(|err| StplugError::Filesystem(err.to_string()))?;
        total += read as u64;
        on_chunk(total);
        token.check()?;
    }

    writer
        .flush()
        .map_err(|err| StplugError::Filesystem(err.to_string()))?;
    token.check()?;
    Ok(total)
}
