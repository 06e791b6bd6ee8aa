//! Log formatting and output with ANSI colors
//!
//! Handles:
//! - Colorized console output with tag and level formatting
//! - Numeric highlighting in messages
//! - Dual output (console + file)
//! - Broken pipe handling for piped commands

use super::file::write_to_file;
use super::tags::LogTag;
use chrono::Local;
use colored::*;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{stdout, ErrorKind, Write};

/// Log format widths for alignment
const TAG_WIDTH: usize = 10;
const LEVEL_WIDTH: usize = 7;

/// Matches dollar values, percentages and bare decimals for highlighting
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?[\d,]+\.?\d*%?)").expect("static regex"));

/// Format and output a log message
pub fn format_and_log(tag: LogTag, level: &str, message: &str) {
    let now = Local::now();
    let time = now.format("%H:%M:%S").to_string();

    let console_line = format!(
        "{} [{}] [{}] {}",
        time.dimmed(),
        format_tag(&tag),
        format_level(level),
        highlight_numbers(message)
    );
    print_stdout_safe(&console_line);

    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let file_line = format!(
        "{} [{}] [{}] {}",
        timestamp,
        tag.to_plain_string(),
        level,
        message
    );
    write_to_file(&file_line);
}

/// Format a tag with appropriate color
fn format_tag(tag: &LogTag) -> ColoredString {
    let padded = format!("{:<width$}", tag.to_plain_string(), width = TAG_WIDTH);
    match tag {
        LogTag::System => padded.bright_yellow().bold(),
        LogTag::Scheduler => padded.bright_cyan().bold(),
        LogTag::Signal => padded.bright_magenta().bold(),
        LogTag::Gate => padded.bright_green().bold(),
        LogTag::Transition => padded.bright_blue().bold(),
        LogTag::Ledger => padded.bright_white().bold(),
        LogTag::Exchange => padded.bright_purple().bold(),
        LogTag::Executor => padded.bright_green().bold(),
        LogTag::Database => padded.bright_blue().bold(),
        LogTag::Notify => padded.bright_cyan().bold(),
        LogTag::Test => padded.white().bold(),
    }
}

/// Format log level with appropriate color
fn format_level(level: &str) -> ColoredString {
    let padded = format!("{:<width$}", level, width = LEVEL_WIDTH);
    match level {
        "ERROR" => padded.bright_red().bold(),
        "WARNING" => padded.yellow().bold(),
        "DEBUG" | "VERBOSE" => padded.dimmed(),
        _ => padded.white().bold(),
    }
}

/// Highlight numbers (amounts, percentages, prices) in a message
fn highlight_numbers(message: &str) -> String {
    NUMBER_RE
        .replace_all(message, |caps: &regex::Captures| {
            caps[1].bright_white().bold().to_string()
        })
        .to_string()
}

/// Print to stdout but ignore broken pipe errors
fn print_stdout_safe(message: &str) {
    if let Err(e) = writeln!(stdout(), "{}", message) {
        if e.kind() == ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
        let _ = writeln!(std::io::stderr(), "Logger stdout error: {}", e);
    }
    if let Err(e) = stdout().flush() {
        if e.kind() == ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
    }
}
