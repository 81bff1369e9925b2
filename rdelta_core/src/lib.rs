pub mod binary_delta;
pub mod content;
pub mod engine;
pub mod handler;
pub mod logging;
pub mod scanner;
pub mod text_delta;

pub use binary_delta::{calculate_entropy, BinaryDeltaMatcher, BinaryDiffStats, MatchParams};
pub use content::{compress, decompress, hash_bytes, hash_file};
pub use engine::DiffEngine;
pub use handler::{replay_chunks, FileHandler, HandlerRegistry};
pub use logging::{FileSink, LogSink, TracingSink};
pub use scanner::FolderScanner;
pub use text_delta::TextDeltaHandler;
