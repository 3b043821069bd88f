//! Log redirection for managed processes
//!
//! Each output stream of a child gets its own pump thread that appends to
//! the configured file, optionally prefixing every line with a timestamp.
//! Supervisor-side failures are appended to the same files as `[procd]`
//! lines so they sit next to the process output.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Open `path` for appending, creating parent directories as needed
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Current local time rendered with a chrono format string
pub fn timestamp(format: &str) -> String {
    chrono::Local::now().format(format).to_string()
}

/// Copy `reader` into `writer` until EOF.
///
/// With `stamp_format` set, output is split into lines and each line is
/// prefixed with `"<timestamp>: "`; a trailing partial line gets a newline.
pub fn pump<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    stamp_format: Option<&str>,
) -> io::Result<u64> {
    let mut copied = 0u64;

    let Some(format) = stamp_format else {
        let mut reader = reader;
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(copied),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.write_all(&buf[..n])?;
            writer.flush()?;
            copied += n as u64;
        }
    };

    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(copied);
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        write!(writer, "{}: ", timestamp(format))?;
        writer.write_all(&line)?;
        writer.flush()?;
        copied += n as u64;
    }
}

/// Start a named thread pumping `reader` into the file at `path`
pub fn spawn_pump<R>(
    label: String,
    reader: R,
    path: &Path,
    stamp_format: Option<String>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let mut file = open_append(path)?;
    let target = path.display().to_string();
    thread::Builder::new()
        .name(format!("log-{label}"))
        .spawn(move || {
            if let Err(e) = pump(reader, &mut file, stamp_format.as_deref()) {
                warn!("Log pump {label} -> {target} failed: {e}");
            }
        })
}

/// Append a supervisor event line to a process log file
pub fn append_event(path: &Path, message: &str, stamp_format: &str) -> io::Result<()> {
    let mut file = open_append(path)?;
    writeln!(file, "{}: [procd] {message}", timestamp(stamp_format))
}

/// Like [`append_event`] but only warns when the file cannot be written
pub fn record_event(path: &Path, message: &str, stamp_format: &str) {
    if let Err(e) = append_event(path, message, stamp_format) {
        warn!("Failed to write event to {}: {e}", path.display());
    }
}
