use crate::binary_delta::BinaryDeltaMatcher;
use crate::text_delta::TextDeltaHandler;
use rdelta_common::{DiffChunk, RDeltaError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Content comparison strategy for one family of files
pub trait FileHandler: Send + Sync {
    /// Produce the chunks that turn `old` into `new`; empty when they are equal
    fn compare(&self, old: &[u8], new: &[u8]) -> Result<Vec<DiffChunk>, RDeltaError>;

    /// Rebuild the new content from `original` and chunks produced by `compare`
    fn apply(&self, original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError>;

    /// Tag recorded on results and chunks produced by this handler
    fn file_type(&self) -> &str;
}

/// Offset-driven replay shared by the built-in handlers.
///
/// Copies `original` verbatim up to each chunk's offset, substitutes the
/// chunk's new bytes for its old bytes, and finishes with the untouched tail.
/// Chunks must be in non-decreasing offset order and stay inside `original`.
pub fn replay_chunks(original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
    let mut result = Vec::with_capacity(original.len());
    let mut last_offset = 0usize;

    for (index, chunk) in chunks.iter().enumerate() {
        let offset = usize::try_from(chunk.offset)
            .map_err(|_| RDeltaError::Patch(format!("chunk {} offset overflows", index)))?;
        let end = offset.checked_add(chunk.old_data.len()).ok_or_else(|| {
            RDeltaError::Patch(format!("chunk {} at offset {} overflows", index, offset))
        })?;

        if offset < last_offset {
            return Err(RDeltaError::Patch(format!(
                "chunk {} at offset {} overlaps previous chunk ending at {}",
                index, offset, last_offset
            )));
        }
        if end > original.len() {
            return Err(RDeltaError::Patch(format!(
                "chunk {} ends at {} past original length {}",
                index,
                end,
                original.len()
            )));
        }

        result.extend_from_slice(&original[last_offset..offset]);
        result.extend_from_slice(&chunk.new_data);
        last_offset = end;
    }

    result.extend_from_slice(&original[last_offset..]);
    Ok(result)
}

/// Extension-keyed handler lookup with a binary fallback.
///
/// Keys are lower-cased and carry a leading dot (`".txt"`). Registration is
/// expected before a comparison starts; lookups only take the read lock.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn FileHandler>>>,
    default_handler: Arc<BinaryDeltaMatcher>,
}

impl HandlerRegistry {
    /// Registry with only the binary fallback
    pub fn new(default_handler: Arc<BinaryDeltaMatcher>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler,
        }
    }

    /// Binary fallback plus the text comparator for `.txt`, `.log` and `.md`
    pub fn with_defaults() -> Self {
        let registry = Self::new(Arc::new(BinaryDeltaMatcher::new()));
        let text: Arc<dyn FileHandler> = Arc::new(TextDeltaHandler);
        for ext in [".txt", ".log", ".md"] {
            registry.register(ext, Arc::clone(&text));
        }
        registry
    }

    /// Add or replace the handler for `extension` (case-insensitive, dot optional)
    pub fn register(&self, extension: &str, handler: Arc<dyn FileHandler>) {
        let key = normalize_extension(extension);
        debug!("Registering {} handler for {}", handler.file_type(), key);
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, handler);
    }

    /// Handler for a path, falling back to the binary matcher
    pub fn resolve(&self, path: &Path) -> Arc<dyn FileHandler> {
        match path.extension() {
            Some(ext) => self.resolve_extension(&ext.to_string_lossy()),
            None => self.fallback(),
        }
    }

    pub fn resolve_extension(&self, extension: &str) -> Arc<dyn FileHandler> {
        let key = normalize_extension(extension);
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match handlers.get(&key) {
            Some(handler) => Arc::clone(handler),
            None => self.fallback(),
        }
    }

    fn fallback(&self) -> Arc<dyn FileHandler> {
        self.default_handler.clone()
    }

    /// The binary matcher used for unrecognized extensions
    pub fn default_handler(&self) -> &Arc<BinaryDeltaMatcher> {
        &self.default_handler
    }

    pub fn extensions(&self) -> Vec<String> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<String> = handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn normalize_extension(extension: &str) -> String {
    let lower = extension.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}
