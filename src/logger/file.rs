//! File persistence for log output
//!
//! One log file per day under the logs directory; lines are appended through
//! a buffered writer behind a mutex so concurrent tasks interleave whole
//! lines, never partial ones.

use chrono::Local;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use crate::paths;

static LOG_FILE: Lazy<Mutex<Option<BufWriter<File>>>> = Lazy::new(|| Mutex::new(None));

/// Open today's log file for appending
///
/// Failures are reported to stderr and leave file logging disabled; console
/// logging still works.
pub fn init_file_logging() {
    let file_name = format!("dcabot_{}.log", Local::now().format("%Y-%m-%d"));
    let path = paths::get_logs_directory().join(file_name);

    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            *LOG_FILE.lock() = Some(BufWriter::new(file));
        }
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", path.display(), e);
        }
    }
}

/// Append a line to the log file (no-op when file logging is disabled)
pub fn write_to_file(line: &str) {
    let mut guard = LOG_FILE.lock();
    if let Some(writer) = guard.as_mut() {
        let _ = writeln!(writer, "{}", line);
    }
}

/// Flush buffered log output to disk
pub fn flush_file_logging() {
    let mut guard = LOG_FILE.lock();
    if let Some(writer) = guard.as_mut() {
        let _ = writer.flush();
    }
}
