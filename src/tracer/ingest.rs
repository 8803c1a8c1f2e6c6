//! Turns the tracer's output file into completed-command records.

use crate::config::TracerConfig;
use crate::core::{CompletedCommand, TraceDecoder};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// Event type of a record describing a finished process.
pub const EXIT_EVENT: &str = "EXIT";

/// Well-known utilities that runner and tooling scripts spawn constantly.
pub const SYSTEM_PROCESSES: &[&str] = &[
    "awk",
    "basename",
    "cat",
    "cut",
    "date",
    "dirname",
    "expr",
    "grep",
    "head",
    "ls",
    "lsb_release",
    "mkdir",
    "mktemp",
    "rm",
    "sed",
    "sh",
    "sleep",
    "sort",
    "sudo",
    "tail",
    "touch",
    "tr",
    "uname",
    "which",
];

/// Filters applied to decoded commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Minimum duration in milliseconds; `-1` disables the filter.
    pub min_duration: i64,
    pub trace_system_processes: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            min_duration: -1,
            trace_system_processes: false,
        }
    }
}

impl From<&TracerConfig> for ParseOptions {
    fn from(config: &TracerConfig) -> Self {
        Self {
            min_duration: config.min_duration,
            trace_system_processes: config.trace_system_processes,
        }
    }
}

pub fn is_system_process(command: &CompletedCommand) -> bool {
    SYSTEM_PROCESSES.contains(&command.name.as_str())
}

/// Decodes one JSON object per line, keeping `EXIT` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesDecoder;

impl TraceDecoder for JsonLinesDecoder {
    fn decode(&self, reader: &mut dyn BufRead) -> std::io::Result<Vec<CompletedCommand>> {
        let mut commands = Vec::new();
        // Raw bytes: process args need not be UTF-8, and a record cut off by
        // the stop signal can end inside a multi-byte character.
        for (index, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<CompletedCommand>(&line) {
                Ok(command) if command.event == EXIT_EVENT => commands.push(command),
                Ok(_) => {}
                Err(e) => debug!(line = index + 1, error = %e, "Skipping malformed trace record"),
            }
        }
        Ok(commands)
    }
}

/// Reads a tracer output file through a [`TraceDecoder`].
pub struct TraceIngest {
    decoder: Box<dyn TraceDecoder>,
}

impl Default for TraceIngest {
    fn default() -> Self {
        Self::new(Box::new(JsonLinesDecoder))
    }
}

impl TraceIngest {
    pub fn new(decoder: Box<dyn TraceDecoder>) -> Self {
        Self { decoder }
    }

    /// Completed commands in `path` that pass `options`. A missing or
    /// unreadable file yields nothing.
    pub fn parse(&self, path: &Path, options: &ParseOptions) -> Vec<CompletedCommand> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                info!(path = %path.display(), error = %e, "No process trace output to ingest");
                return Vec::new();
            }
        };

        let mut reader = BufReader::new(file);
        let commands = match self.decoder.decode(&mut reader) {
            Ok(commands) => commands,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read process trace output");
                return Vec::new();
            }
        };

        let total = commands.len();
        let kept = filter(commands, options);
        debug!(total, kept = kept.len(), "Ingested process trace");
        kept
    }
}

/// Applies the duration and system-process filters.
pub fn filter(commands: Vec<CompletedCommand>, options: &ParseOptions) -> Vec<CompletedCommand> {
    commands
        .into_iter()
        .filter(|c| options.min_duration < 0 || c.duration >= options.min_duration)
        .filter(|c| options.trace_system_processes || !is_system_process(c))
        .collect()
}
