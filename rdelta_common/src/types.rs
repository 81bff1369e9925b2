use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Chunk tag emitted by the binary delta matcher
pub const CHUNK_TYPE_BINARY: &str = "binary";
/// Chunk tag emitted by the line-oriented text comparator
pub const CHUNK_TYPE_TEXT: &str = "text";

/// A single unit of recorded difference between two byte buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChunk {
    /// Position in the old content where the change begins
    pub offset: u64,
    /// Bytes replaced in the old content
    pub old_data: Vec<u8>,
    /// Bytes inserted in their place (gzip-compressed when the owning result says so)
    pub new_data: Vec<u8>,
    /// Tag of the handler that produced this chunk
    pub chunk_type: String,
}

impl DiffChunk {
    pub fn new(offset: u64, old_data: Vec<u8>, new_data: Vec<u8>, chunk_type: &str) -> Self {
        Self {
            offset,
            old_data,
            new_data,
            chunk_type: chunk_type.to_string(),
        }
    }

    /// Offset just past the old bytes this chunk replaces
    pub fn old_end(&self) -> u64 {
        self.offset + self.old_data.len() as u64
    }
}

/// A regular file found while walking a tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the walked root
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub permissions: u32,
}

/// How a path differs between the old and the new tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Added,
    Modified,
    Deleted,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Added => "added",
            Operation::Modified => "modified",
            Operation::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-path outcome of a directory comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    /// Path relative to the compared tree roots
    pub path: PathBuf,
    pub operation: Operation,
    /// Hex SHA-256 of the old file (modified and deleted results)
    pub old_hash: Option<String>,
    /// Hex SHA-256 of the new file (added and modified results)
    pub new_hash: Option<String>,
    /// Ordered by offset; empty for deletions
    pub chunks: Vec<DiffChunk>,
    pub file_type: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Unix mode bits; synthesized from the read-only flag on other platforms
    pub permissions: u32,
    /// Whether every chunk's `new_data` is gzip-compressed
    pub is_compressed: bool,
}

impl DiffResult {
    /// Sum of the (possibly compressed) payload bytes carried by this result
    pub fn payload_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.new_data.len() as u64).sum()
    }
}

/// Why a file in the new tree produced no result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// File is larger than the configured comparison limit
    TooLarge { size: u64, limit: u64 },
    /// Reading or comparing the file failed
    Failed { message: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge { size, limit } => {
                write!(f, "file too large ({} bytes, limit {})", size, limit)
            }
            SkipReason::Failed { message } => write!(f, "comparison failed: {}", message),
        }
    }
}

/// A file that was left out of the results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Aggregate statistics over one directory comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub total_files: usize,
    pub added_files: usize,
    pub modified_files: usize,
    pub deleted_files: usize,
    /// Size of every added or modified file, as found in the new tree
    pub total_size_bytes: u64,
    /// Payload bytes of compressed results
    pub compressed_bytes: u64,
    /// File type tag to number of results carrying it
    pub file_types: BTreeMap<String, usize>,
    /// Files excluded for size or failure; never counted in the totals above
    pub skipped: Vec<SkippedFile>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl DiffSummary {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            total_files: 0,
            added_files: 0,
            modified_files: 0,
            deleted_files: 0,
            total_size_bytes: 0,
            compressed_bytes: 0,
            file_types: BTreeMap::new(),
            skipped: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }

    /// Account for one produced result
    pub fn record(&mut self, result: &DiffResult) {
        self.total_files += 1;
        match result.operation {
            Operation::Added => self.added_files += 1,
            Operation::Modified => self.modified_files += 1,
            Operation::Deleted => {
                self.deleted_files += 1;
                return;
            }
        }

        self.total_size_bytes += result.size;
        if result.is_compressed {
            self.compressed_bytes += result.payload_bytes();
        }
        *self.file_types.entry(result.file_type.clone()).or_insert(0) += 1;
    }

    pub fn record_skipped(&mut self, skipped: SkippedFile) {
        self.skipped.push(skipped);
    }

    /// Stamp the end time once all work has been aggregated
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

impl Default for DiffSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Comparison policy, read-only for the lifetime of one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Gzip every chunk payload
    pub compress_patches: bool,

    /// Gzip level, 1 (fastest) to 9 (best)
    pub compression_level: u32,

    /// Nominal chunk size in bytes
    pub chunk_size: u64,

    /// Maximum number of file comparisons in flight
    pub concurrency: usize,

    /// Gitignore-style patterns, matched against paths relative to the tree root
    pub ignore_patterns: Vec<String>,

    /// When non-empty, only files matching one of these patterns are compared
    pub include_patterns: Vec<String>,

    /// Reserved for restore tooling; not consulted while comparing
    pub preserve_permissions: bool,

    /// Files larger than this are skipped
    pub max_file_size_bytes: u64,

    /// Reserved for restore tooling; not consulted while comparing
    pub backup_files: bool,

    /// Reserved for restore tooling; must exist when set
    pub backup_dir: Option<PathBuf>,

    /// Emit per-file debug messages through the log sink
    pub detailed_logging: bool,

    /// Append log lines to this file in addition to tracing output
    pub log_file: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            compress_patches: true,
            compression_level: 9,
            chunk_size: 1024 * 1024,
            concurrency: 4,
            ignore_patterns: Vec::new(),
            include_patterns: Vec::new(),
            preserve_permissions: true,
            max_file_size_bytes: 100 * 1024 * 1024,
            backup_files: false,
            backup_dir: None,
            detailed_logging: false,
            log_file: None,
        }
    }
}
