use ignore::gitignore::{Gitignore, GitignoreBuilder};
use jwalk::{Parallelism, WalkDir};
use rdelta_common::{Configuration, FileEntry, RDeltaError};
use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Depth-first walker over the regular files of one tree, filtered by the
/// configured ignore and include patterns
pub struct FolderScanner {
    ignore: Option<Gitignore>,
    include: Option<Gitignore>,
}

impl FolderScanner {
    pub fn new(config: &Configuration) -> Result<Self, RDeltaError> {
        Ok(Self {
            ignore: build_matcher(&config.ignore_patterns, "ignore")?,
            include: build_matcher(&config.include_patterns, "include")?,
        })
    }

    /// Whether a root-relative file path takes part in the comparison
    pub fn is_selected(&self, path: &Path) -> bool {
        if let Some(ref ignore) = self.ignore {
            if matches_with_parents(ignore, path) {
                return false;
            }
        }

        match self.include {
            Some(ref include) => matches_with_parents(include, path),
            None => true,
        }
    }

    /// Walk `root` in sorted depth-first order and hand every selected regular
    /// file to `visit`. Enumeration errors abort the walk; so does an error
    /// returned by `visit`.
    pub fn scan_files<F>(&self, root: &Path, mut visit: F) -> Result<usize, RDeltaError>
    where
        F: FnMut(FileEntry) -> Result<(), RDeltaError>,
    {
        if !root.is_dir() {
            return Err(RDeltaError::Walk(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        let walker = WalkDir::new(root)
            .sort(true)
            .skip_hidden(false)
            .follow_links(false)
            .parallelism(Parallelism::Serial);

        let mut visited = 0usize;
        for entry in walker {
            let entry = entry.map_err(|e| RDeltaError::Walk(format!("{}: {}", root.display(), e)))?;

            // Symlinks are neither followed nor reported
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative_path = path
                .strip_prefix(root)
                .map_err(|e| RDeltaError::Path(e.to_string()))?
                .to_path_buf();

            if !self.is_selected(&relative_path) {
                debug!("Filtered out {}", relative_path.display());
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| RDeltaError::Walk(format!("{}: {}", path.display(), e)))?;

            visit(FileEntry {
                path: relative_path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                permissions: mode_bits(&metadata),
            })?;
            visited += 1;
        }

        debug!("Visited {} files under {:?}", visited, root);
        Ok(visited)
    }
}

fn build_matcher(patterns: &[String], kind: &str) -> Result<Option<Gitignore>, RDeltaError> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GitignoreBuilder::new("");
    for pattern in patterns {
        builder.add_line(None, pattern).map_err(|e| {
            RDeltaError::Config(format!("Invalid {} pattern '{}': {}", kind, pattern, e))
        })?;
    }

    let matcher = builder
        .build()
        .map_err(|e| RDeltaError::Config(format!("Failed to build {} patterns: {}", kind, e)))?;
    debug!("Built {} matcher with {} patterns", kind, patterns.len());
    Ok(Some(matcher))
}

/// Match the file itself, then every parent directory
fn matches_with_parents(matcher: &Gitignore, path: &Path) -> bool {
    if matcher.matched(path, false).is_ignore() {
        return true;
    }

    let mut current = path;
    while let Some(parent) = current.parent() {
        if !parent.as_os_str().is_empty() && matcher.matched(parent, true).is_ignore() {
            return true;
        }
        current = parent;
    }
    false
}

#[cfg(unix)]
pub(crate) fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
pub(crate) fn mode_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
