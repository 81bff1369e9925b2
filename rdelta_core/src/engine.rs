use crate::content::{compress, decompress, hash_bytes, hash_file};
use crate::handler::{FileHandler, HandlerRegistry};
use crate::logging::{FileSink, LogSink, TracingSink};
use crate::scanner::FolderScanner;
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use rdelta_common::{
    Configuration, DiffChunk, DiffResult, DiffSummary, FileEntry, Operation, RDeltaError,
    SkipReason, SkippedFile,
};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{info, Level};

/// What a worker (or the walkers) reports to the collector
enum Outcome {
    Changed(DiffResult),
    Skipped(SkippedFile),
}

/// Compares two directory trees with a bounded number of concurrent file
/// comparisons.
///
/// Files in the new tree are compared against the same relative path in the
/// old tree by the handler registered for their extension; files only found
/// in the old tree are reported as deleted once all comparisons have finished.
pub struct DiffEngine {
    config: Configuration,
    registry: HandlerRegistry,
    scanner: FolderScanner,
    sink: Arc<dyn LogSink>,
}

impl DiffEngine {
    /// Validate `config` and build an engine with the default handlers.
    ///
    /// Logs go to `config.log_file` when set, otherwise to `tracing`.
    pub fn new(config: Configuration) -> Result<Self, RDeltaError> {
        let sink: Arc<dyn LogSink> = match config.log_file {
            Some(ref path) => Arc::new(FileSink::open(path)?),
            None => Arc::new(TracingSink),
        };
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: Configuration, sink: Arc<dyn LogSink>) -> Result<Self, RDeltaError> {
        config.validate()?;
        let scanner = FolderScanner::new(&config)?;
        Ok(Self {
            config,
            registry: HandlerRegistry::with_defaults(),
            scanner,
            sink,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Route files with `extension` to `handler` in later comparisons
    pub fn register_handler(&self, extension: &str, handler: Arc<dyn FileHandler>) {
        self.registry.register(extension, handler);
    }

    /// Compare `old_root` against `new_root`.
    ///
    /// Results are sorted by path. Files that could not be compared are listed
    /// in `summary.skipped` and never fail the run; only errors enumerating
    /// either tree do.
    pub fn compare_dirs(
        &self,
        old_root: &Path,
        new_root: &Path,
    ) -> Result<(DiffSummary, Vec<DiffResult>), RDeltaError> {
        for root in [old_root, new_root] {
            if !root.is_dir() {
                return Err(RDeltaError::Walk(format!(
                    "Not a directory: {}",
                    root.display()
                )));
            }
        }

        let workers = self.config.concurrency;
        self.sink.log(
            Level::INFO,
            &format!(
                "Comparing {} -> {} with {} workers",
                old_root.display(),
                new_root.display(),
                workers
            ),
        );

        let (job_tx, job_rx) = bounded::<FileEntry>(workers);
        let (outcome_tx, outcome_rx) = unbounded::<Outcome>();

        let scoped = thread::scope(|scope| -> Result<(DiffSummary, Vec<DiffResult>), RDeltaError> {
            let collector = scope.spawn(move || collect(outcome_rx));

            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let jobs = job_rx.clone();
                    let outcomes = outcome_tx.clone();
                    scope.spawn(move || self.run_worker(old_root, new_root, jobs, outcomes))
                })
                .collect();
            drop(job_rx);

            let walked = self.walk_new(new_root, &job_tx, &outcome_tx);
            drop(job_tx);

            let mut joined = Ok(());
            for handle in handles {
                if handle.join().is_err() {
                    joined = Err(RDeltaError::Handler("comparison worker panicked".to_string()));
                }
            }

            let walked = walked
                .and(joined)
                .and_then(|_| self.walk_old(old_root, new_root, &outcome_tx));
            drop(outcome_tx);

            let collected = collector
                .join()
                .map_err(|_| RDeltaError::Handler("result collector panicked".to_string()));
            walked?;
            collected
        });
        let (mut summary, mut results) = scoped?;

        results.sort_by(|a, b| a.path.cmp(&b.path));
        summary.skipped.sort_by(|a, b| a.path.cmp(&b.path));
        summary.finish();

        self.sink.log(
            Level::INFO,
            &format!(
                "Comparison finished: {} added, {} modified, {} deleted, {} skipped",
                summary.added_files,
                summary.modified_files,
                summary.deleted_files,
                summary.skipped.len()
            ),
        );
        Ok((summary, results))
    }

    /// Rebuild the new content described by `result` from the old tree.
    ///
    /// Returns `None` for deletions.
    pub fn reconstruct(
        &self,
        old_root: &Path,
        result: &DiffResult,
    ) -> Result<Option<Vec<u8>>, RDeltaError> {
        let original = match result.operation {
            Operation::Deleted => return Ok(None),
            Operation::Added => Vec::new(),
            Operation::Modified => fs::read(old_root.join(&result.path))?,
        };

        let chunks = if result.is_compressed {
            result
                .chunks
                .iter()
                .map(|chunk| -> Result<DiffChunk, RDeltaError> {
                    Ok(DiffChunk {
                        new_data: decompress(&chunk.new_data)?,
                        ..chunk.clone()
                    })
                })
                .collect::<Result<Vec<_>, RDeltaError>>()?
        } else {
            result.chunks.clone()
        };

        let handler = self.registry.resolve(&result.path);
        handler.apply(&original, &chunks).map(Some)
    }

    fn walk_new(
        &self,
        new_root: &Path,
        jobs: &Sender<FileEntry>,
        outcomes: &Sender<Outcome>,
    ) -> Result<usize, RDeltaError> {
        let limit = self.config.max_file_size_bytes;
        self.scanner.scan_files(new_root, |entry| {
            if entry.size > limit {
                self.sink.log(
                    Level::WARN,
                    &format!(
                        "Skipping large file: {} ({} bytes)",
                        entry.path.display(),
                        entry.size
                    ),
                );
                let skipped = SkippedFile {
                    path: entry.path,
                    reason: SkipReason::TooLarge {
                        size: entry.size,
                        limit,
                    },
                };
                return send(outcomes, Outcome::Skipped(skipped));
            }

            // Blocks while every worker is busy and the queue is full.
            jobs.send(entry)
                .map_err(|_| RDeltaError::Handler("comparison workers stopped".to_string()))
        })
    }

    fn walk_old(
        &self,
        old_root: &Path,
        new_root: &Path,
        outcomes: &Sender<Outcome>,
    ) -> Result<usize, RDeltaError> {
        self.scanner.scan_files(old_root, |entry| {
            if is_regular_file(&new_root.join(&entry.path)) {
                return Ok(());
            }

            let old_hash = match hash_file(&old_root.join(&entry.path)) {
                Ok(hash) => hash,
                Err(e) => {
                    let message = e.to_string();
                    self.sink.log(
                        Level::ERROR,
                        &format!("Error hashing {}: {}", entry.path.display(), message),
                    );
                    let skipped = SkippedFile {
                        path: entry.path,
                        reason: SkipReason::Failed { message },
                    };
                    return send(outcomes, Outcome::Skipped(skipped));
                }
            };
            if self.config.detailed_logging {
                self.sink
                    .log(Level::DEBUG, &format!("Deleted: {}", entry.path.display()));
            }

            let file_type = self.registry.resolve(&entry.path).file_type().to_string();
            send(
                outcomes,
                Outcome::Changed(DiffResult {
                    path: entry.path,
                    operation: Operation::Deleted,
                    old_hash: Some(old_hash),
                    new_hash: None,
                    chunks: Vec::new(),
                    file_type,
                    size: entry.size,
                    modified: DateTime::<Utc>::from(entry.modified),
                    permissions: entry.permissions,
                    is_compressed: false,
                }),
            )
        })
    }

    fn run_worker(
        &self,
        old_root: &Path,
        new_root: &Path,
        jobs: Receiver<FileEntry>,
        outcomes: Sender<Outcome>,
    ) {
        for entry in jobs {
            if let Some(outcome) = self.process_file(old_root, new_root, entry) {
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
        }
    }

    /// Compare one file, turning errors and handler panics into a skip record
    fn process_file(&self, old_root: &Path, new_root: &Path, entry: FileEntry) -> Option<Outcome> {
        let attempt =
            panic::catch_unwind(AssertUnwindSafe(|| self.diff_file(old_root, new_root, &entry)));

        let message = match attempt {
            Ok(Ok(Some(Outcome::Changed(result)))) => {
                if self.config.detailed_logging {
                    self.sink.log(
                        Level::DEBUG,
                        &format!(
                            "{}: {} ({} chunks)",
                            result.operation,
                            result.path.display(),
                            result.chunks.len()
                        ),
                    );
                }
                return Some(Outcome::Changed(result));
            }
            Ok(Ok(Some(skipped))) => return Some(skipped),
            Ok(Ok(None)) => {
                if self.config.detailed_logging {
                    self.sink
                        .log(Level::DEBUG, &format!("Unchanged: {}", entry.path.display()));
                }
                return None;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
        };

        self.sink.log(
            Level::ERROR,
            &format!("Error comparing {}: {}", entry.path.display(), message),
        );
        Some(Outcome::Skipped(SkippedFile {
            path: entry.path,
            reason: SkipReason::Failed { message },
        }))
    }

    fn diff_file(
        &self,
        old_root: &Path,
        new_root: &Path,
        entry: &FileEntry,
    ) -> Result<Option<Outcome>, RDeltaError> {
        let old_path = old_root.join(&entry.path);
        let old_size = regular_file_size(&old_path);

        let limit = self.config.max_file_size_bytes;
        if let Some(size) = old_size.filter(|&size| size > limit) {
            self.sink.log(
                Level::WARN,
                &format!(
                    "Skipping file with large baseline: {} ({} bytes)",
                    entry.path.display(),
                    size
                ),
            );
            return Ok(Some(Outcome::Skipped(SkippedFile {
                path: entry.path.clone(),
                reason: SkipReason::TooLarge { size, limit },
            })));
        }

        let new_data = fs::read(new_root.join(&entry.path))?;
        let handler = self.registry.resolve(&entry.path);

        let (operation, old_hash, chunks) = if old_size.is_some() {
            let old_data = fs::read(&old_path)?;
            if old_data == new_data {
                return Ok(None);
            }

            let chunks = handler.compare(&old_data, &new_data)?;
            if chunks.is_empty() {
                return Ok(None);
            }
            (Operation::Modified, Some(hash_bytes(&old_data)), chunks)
        } else {
            let chunk = DiffChunk::new(0, Vec::new(), new_data.clone(), handler.file_type());
            (Operation::Added, None, vec![chunk])
        };

        let chunks = if self.config.compress_patches {
            chunks
                .into_iter()
                .map(|chunk| -> Result<DiffChunk, RDeltaError> {
                    Ok(DiffChunk {
                        new_data: compress(&chunk.new_data, self.config.compression_level)?,
                        ..chunk
                    })
                })
                .collect::<Result<Vec<_>, RDeltaError>>()?
        } else {
            chunks
        };

        Ok(Some(Outcome::Changed(DiffResult {
            path: entry.path.clone(),
            operation,
            old_hash,
            new_hash: Some(hash_bytes(&new_data)),
            chunks,
            file_type: handler.file_type().to_string(),
            size: new_data.len() as u64,
            modified: DateTime::<Utc>::from(entry.modified),
            permissions: entry.permissions,
            is_compressed: self.config.compress_patches,
        })))
    }
}

/// Single owner of the summary and result list for one comparison
fn collect(outcomes: Receiver<Outcome>) -> (DiffSummary, Vec<DiffResult>) {
    let mut summary = DiffSummary::new();
    let mut results = Vec::new();

    for outcome in outcomes {
        match outcome {
            Outcome::Changed(result) => {
                summary.record(&result);
                results.push(result);
            }
            Outcome::Skipped(skipped) => summary.record_skipped(skipped),
        }
    }

    info!(
        "Collected {} results, {} skipped",
        results.len(),
        summary.skipped.len()
    );
    (summary, results)
}

fn send(outcomes: &Sender<Outcome>, outcome: Outcome) -> Result<(), RDeltaError> {
    outcomes
        .send(outcome)
        .map_err(|_| RDeltaError::Handler("result collector stopped".to_string()))
}

fn is_regular_file(path: &Path) -> bool {
    regular_file_size(path).is_some()
}

/// Size of `path` when it is a regular file (symlinks not followed)
fn regular_file_size(path: &Path) -> Option<u64> {
    fs::symlink_metadata(path)
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::replay_chunks;
    use filetime::{set_file_mtime, FileTime};
    use rdelta_common::{CHUNK_TYPE_BINARY, CHUNK_TYPE_TEXT};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Trees {
        _temp: TempDir,
        old: PathBuf,
        new: PathBuf,
    }

    fn trees() -> Trees {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old");
        let new = temp.path().join("new");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();
        Trees {
            _temp: temp,
            old,
            new,
        }
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for MemorySink {
        fn log(&self, level: Level, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    struct PanickingHandler;

    impl FileHandler for PanickingHandler {
        fn compare(&self, _old: &[u8], _new: &[u8]) -> Result<Vec<DiffChunk>, RDeltaError> {
            panic!("boom");
        }

        fn apply(&self, original: &[u8], _chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
            Ok(original.to_vec())
        }

        fn file_type(&self) -> &str {
            "panicky"
        }
    }

    #[test]
    fn test_added_file() {
        let t = trees();
        write(&t.old, "a.txt", b"hello");
        write(&t.new, "a.txt", b"hello");
        write(&t.new, "b.bin", &[0xDE, 0xAD]);

        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(summary.added_files, 1);
        assert_eq!(summary.total_files, 1);
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.path, PathBuf::from("b.bin"));
        assert_eq!(result.operation, Operation::Added);
        assert!(result.is_compressed);
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(decompress(&result.chunks[0].new_data).unwrap(), vec![0xDE, 0xAD]);
        assert_eq!(result.new_hash.as_deref(), Some(hash_bytes(&[0xDE, 0xAD]).as_str()));
        assert_eq!(result.old_hash, None);
        assert_eq!(result.file_type, CHUNK_TYPE_BINARY);
    }

    #[test]
    fn test_modified_text_file() {
        let t = trees();
        write(&t.old, "a.txt", b"hello\nworld");
        write(&t.new, "a.txt", b"hello\nmars");

        let config = Configuration {
            compress_patches: false,
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(summary.modified_files, 1);
        assert_eq!(summary.file_types.get(CHUNK_TYPE_TEXT), Some(&1));
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.operation, Operation::Modified);
        assert_eq!(result.file_type, CHUNK_TYPE_TEXT);
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].offset, 6);
        assert_eq!(result.chunks[0].old_data, b"world");
        assert_eq!(result.chunks[0].new_data, b"mars");
        assert!(result.old_hash.is_some());
        assert_ne!(result.old_hash, result.new_hash);
    }

    #[test]
    fn test_deleted_file() {
        let t = trees();
        let data: Vec<u8> = (0..1000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        write(&t.old, "c.bin", &data);

        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.total_files, 1);
        assert_eq!(summary.total_size_bytes, 0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].operation, Operation::Deleted);
        assert_eq!(results[0].old_hash.as_deref(), Some(hash_bytes(&data).as_str()));
        assert_eq!(results[0].size, 1000);
        assert!(results[0].chunks.is_empty());
        assert_eq!(engine.reconstruct(&t.old, &results[0]).unwrap(), None);
    }

    #[test]
    fn test_large_file_skipped() {
        let t = trees();
        write(&t.old, "big.bin", &[1u8; 64]);
        write(&t.new, "big.bin", &[2u8; 64]);

        let config = Configuration {
            max_file_size_bytes: 32,
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert!(results.is_empty());
        assert_eq!(summary.total_files, 0);
        assert_eq!(summary.added_files, 0);
        assert_eq!(summary.modified_files, 0);
        assert_eq!(summary.deleted_files, 0);
        assert_eq!(
            summary.skipped,
            vec![SkippedFile {
                path: PathBuf::from("big.bin"),
                reason: SkipReason::TooLarge { size: 64, limit: 32 },
            }]
        );
    }

    #[test]
    fn test_ignore_and_include_patterns() {
        let t = trees();
        write(&t.new, "keep/data.bin", b"data");
        write(&t.new, "keep/skip.tmp", b"tmp");
        write(&t.new, "other/data.bin", b"data");
        write(&t.old, "keep/gone.bin", b"old");
        write(&t.old, "other/gone.bin", b"old");

        let config = Configuration {
            ignore_patterns: vec!["*.tmp".to_string()],
            include_patterns: vec!["keep/".to_string()],
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        let paths: Vec<_> = results.iter().map(|r| (r.path.clone(), r.operation)).collect();
        assert_eq!(
            paths,
            vec![
                (PathBuf::from("keep/data.bin"), Operation::Added),
                (PathBuf::from("keep/gone.bin"), Operation::Deleted),
            ]
        );
        assert_eq!(summary.total_files, 2);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = Configuration {
            ignore_patterns: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(matches!(DiffEngine::new(config), Err(RDeltaError::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Configuration {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(DiffEngine::new(config), Err(RDeltaError::Config(_))));
    }

    #[test]
    fn test_missing_root_is_walk_error() {
        let t = trees();
        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let result = engine.compare_dirs(&t.old.join("missing"), &t.new);
        assert!(matches!(result, Err(RDeltaError::Walk(_))));
    }

    #[test]
    fn test_handler_panic_becomes_skip() {
        let t = trees();
        write(&t.old, "x.boom", b"one");
        write(&t.new, "x.boom", b"two");
        write(&t.old, "ok.bin", b"same-prefix-old");
        write(&t.new, "ok.bin", b"same-prefix-new");

        let sink = Arc::new(MemorySink::default());
        let engine = DiffEngine::with_sink(Configuration::default(), sink.clone()).unwrap();
        engine.register_handler("boom", Arc::new(PanickingHandler));

        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, PathBuf::from("ok.bin"));
        assert_eq!(summary.total_files, 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].path, PathBuf::from("x.boom"));
        match &summary.skipped[0].reason {
            SkipReason::Failed { message } => assert!(message.contains("boom")),
            other => panic!("unexpected reason: {:?}", other),
        }

        let lines = sink.lines.lock().unwrap();
        assert!(lines
            .iter()
            .any(|(level, msg)| *level == Level::ERROR && msg.contains("x.boom")));
    }

    #[test]
    fn test_reconstruct_roundtrip() {
        let t = trees();
        write(&t.old, "notes.md", b"# Title\nbody\nend\n");
        write(&t.new, "notes.md", b"# Title\nnew body\nend\nmore\n");
        let old_bin: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut new_bin = old_bin.clone();
        new_bin[5_000] ^= 0xFF;
        new_bin.extend_from_slice(b"tail");
        write(&t.old, "blob.dat", &old_bin);
        write(&t.new, "blob.dat", &new_bin);
        write(&t.new, "fresh.txt", b"brand new");

        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let (_, results) = engine.compare_dirs(&t.old, &t.new).unwrap();
        assert_eq!(results.len(), 3);

        for result in &results {
            let rebuilt = engine.reconstruct(&t.old, result).unwrap().unwrap();
            let expected = fs::read(t.new.join(&result.path)).unwrap();
            assert_eq!(rebuilt, expected, "{}", result.path.display());
        }
    }

    #[test]
    fn test_concurrency_does_not_change_results() {
        let t = trees();
        for i in 0..40 {
            write(&t.old, &format!("dir{}/file{}.bin", i % 4, i), format!("old {}", i).as_bytes());
            if i % 3 != 0 {
                write(&t.new, &format!("dir{}/file{}.bin", i % 4, i), format!("new {}", i).as_bytes());
            }
            if i % 5 == 0 {
                write(&t.new, &format!("added{}.txt", i), b"added");
            }
        }

        let run = |concurrency: usize| {
            let config = Configuration {
                concurrency,
                ..Default::default()
            };
            DiffEngine::new(config)
                .unwrap()
                .compare_dirs(&t.old, &t.new)
                .unwrap()
        };

        let (serial_summary, serial) = run(1);
        let (parallel_summary, parallel) = run(8);

        assert_eq!(serial_summary.added_files, 8);
        assert_eq!(serial_summary.modified_files, 26);
        assert_eq!(serial_summary.deleted_files, 14);
        assert_eq!(serial_summary.added_files, parallel_summary.added_files);
        assert_eq!(serial_summary.modified_files, parallel_summary.modified_files);
        assert_eq!(serial_summary.deleted_files, parallel_summary.deleted_files);
        assert_eq!(serial_summary.total_size_bytes, parallel_summary.total_size_bytes);

        let serial_paths: Vec<_> = serial.iter().map(|r| r.path.clone()).collect();
        let parallel_paths: Vec<_> = parallel.iter().map(|r| r.path.clone()).collect();
        assert_eq!(serial_paths, parallel_paths);
    }

    #[test]
    fn test_result_metadata_comes_from_new_tree() {
        let t = trees();
        write(&t.old, "m.bin", b"before");
        write(&t.new, "m.bin", b"after!!");
        let stamp = FileTime::from_unix_time(1_600_000_000, 0);
        set_file_mtime(t.new.join("m.bin"), stamp).unwrap();

        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(results[0].size, 7);
        assert_eq!(summary.total_size_bytes, 7);
        assert_eq!(results[0].modified.timestamp(), 1_600_000_000);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(t.new.join("m.bin")).unwrap().permissions().mode();
            assert_eq!(results[0].permissions, mode);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_deleted_file_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let t = trees();
        write(&t.old, "keep.bin", b"keep");
        write(&t.new, "keep.bin", b"kept");
        write(&t.old, "gone.bin", b"secret");
        let gone = t.old.join("gone.bin");
        fs::set_permissions(&gone, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&gone).is_ok() {
            // Permission bits are not enforced for this user (root)
            return;
        }

        let engine = DiffEngine::new(Configuration::default()).unwrap();
        let outcome = engine.compare_dirs(&t.old, &t.new);
        fs::set_permissions(&gone, fs::Permissions::from_mode(0o644)).unwrap();
        let (summary, results) = outcome.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, PathBuf::from("keep.bin"));
        assert_eq!(results[0].operation, Operation::Modified);
        assert_eq!(summary.deleted_files, 0);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].path, PathBuf::from("gone.bin"));
        assert!(matches!(summary.skipped[0].reason, SkipReason::Failed { .. }));
    }

    #[test]
    fn test_large_baseline_skipped() {
        let t = trees();
        write(&t.old, "x.bin", &[9u8; 4096]);
        write(&t.new, "x.bin", &[1u8; 10]);
        write(&t.old, "small.bin", b"old");
        write(&t.new, "small.bin", b"new");

        let config = Configuration {
            max_file_size_bytes: 1024,
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        let (summary, results) = engine.compare_dirs(&t.old, &t.new).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, PathBuf::from("small.bin"));
        assert_eq!(summary.modified_files, 1);
        assert_eq!(
            summary.skipped,
            vec![SkippedFile {
                path: PathBuf::from("x.bin"),
                reason: SkipReason::TooLarge {
                    size: 4096,
                    limit: 1024
                },
            }]
        );
    }

    /// Records how many comparisons run at the same time
    #[derive(Default)]
    struct GateHandler {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FileHandler for GateHandler {
        fn compare(&self, old: &[u8], new: &[u8]) -> Result<Vec<DiffChunk>, RDeltaError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![DiffChunk::new(0, old.to_vec(), new.to_vec(), "gate")])
        }

        fn apply(&self, original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
            replay_chunks(original, chunks)
        }

        fn file_type(&self) -> &str {
            "gate"
        }
    }

    fn peak_in_flight(concurrency: usize) -> usize {
        let t = trees();
        for i in 0..24 {
            write(&t.old, &format!("f{}.gate", i), format!("old {}", i).as_bytes());
            write(&t.new, &format!("f{}.gate", i), format!("new {}", i).as_bytes());
        }

        let config = Configuration {
            concurrency,
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        let handler = Arc::new(GateHandler::default());
        engine.register_handler("gate", handler.clone());

        let (summary, _) = engine.compare_dirs(&t.old, &t.new).unwrap();
        assert_eq!(summary.modified_files, 24);
        assert_eq!(handler.in_flight.load(Ordering::SeqCst), 0);
        handler.peak.load(Ordering::SeqCst)
    }

    #[test]
    fn test_admission_gate_bounds_in_flight_comparisons() {
        assert_eq!(peak_in_flight(1), 1);

        let peak = peak_in_flight(3);
        assert!(peak <= 3, "peak {} exceeds concurrency", peak);
        assert!(peak > 1, "comparisons never overlapped");
    }

    #[test]
    fn test_file_sink_receives_messages() {
        let t = trees();
        write(&t.new, "a.bin", b"a");
        let log_path = t.old.parent().unwrap().join("engine.log");

        let config = Configuration {
            log_file: Some(log_path.clone()),
            detailed_logging: true,
            ..Default::default()
        };
        let engine = DiffEngine::new(config).unwrap();
        engine.compare_dirs(&t.old, &t.new).unwrap();

        let content = fs::read_to_string(log_path).unwrap();
        assert!(content.contains("Comparing"));
        assert!(content.contains("added: a.bin"));
        assert!(content.contains("Comparison finished"));
    }
}
