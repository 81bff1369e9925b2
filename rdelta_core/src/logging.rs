use chrono::{SecondsFormat, Utc};
use rdelta_common::RDeltaError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;

/// Destination for engine log messages, owned by one engine instance
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards messages to the global `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        emit(level, message);
    }
}

/// Appends timestamped lines to a file and forwards them to `tracing`
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Self, RDeltaError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(RDeltaError::Config(format!(
                    "log directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn log(&self, level: Level, message: &str) {
        let line = format!(
            "[{}] {} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level,
            message
        );

        if let Ok(mut file) = self.file.lock() {
            // A failed log write must not fail the comparison.
            let _ = file.write_all(line.as_bytes());
        }
        emit(level, message);
    }
}

fn emit(level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!(target: "rdelta", "{}", message),
        Level::WARN => tracing::warn!(target: "rdelta", "{}", message),
        Level::INFO => tracing::info!(target: "rdelta", "{}", message),
        Level::DEBUG => tracing::debug!(target: "rdelta", "{}", message),
        _ => tracing::trace!(target: "rdelta", "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_appends_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("diff.log");

        let sink = FileSink::open(&path).unwrap();
        sink.log(Level::INFO, "first message");
        sink.log(Level::WARN, "second message");

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("INFO first message"));
        assert!(lines[1].ends_with("WARN second message"));
    }

    #[test]
    fn test_file_sink_keeps_existing_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("diff.log");
        fs::write(&path, "earlier\n").unwrap();

        let sink = FileSink::open(&path).unwrap();
        sink.log(Level::ERROR, "later");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("earlier\n"));
        assert!(content.contains("ERROR later"));
    }

    #[test]
    fn test_file_sink_missing_directory() {
        let temp = TempDir::new().unwrap();
        let result = FileSink::open(&temp.path().join("missing").join("diff.log"));
        assert!(matches!(result, Err(RDeltaError::Config(_))));
    }
}
