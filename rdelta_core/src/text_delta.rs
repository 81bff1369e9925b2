use crate::handler::{replay_chunks, FileHandler};
use rdelta_common::{DiffChunk, RDeltaError, CHUNK_TYPE_TEXT};

/// Line-by-line comparator for plain text.
///
/// Lines are paired by index, so an inserted or deleted line shows up as a
/// change to every line after it. When the line counts differ, the unpaired
/// tail becomes one trailing chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDeltaHandler;

impl TextDeltaHandler {
    pub fn compare(&self, old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
        if old == new {
            return Vec::new();
        }

        let old_lines: Vec<&[u8]> = old.split(|&b| b == b'\n').collect();
        let new_lines: Vec<&[u8]> = new.split(|&b| b == b'\n').collect();

        let mut chunks = Vec::new();
        let mut old_offset = 0usize;
        let mut new_offset = 0usize;

        for (old_line, new_line) in old_lines.iter().zip(&new_lines) {
            if old_line != new_line {
                chunks.push(DiffChunk::new(
                    old_offset as u64,
                    old_line.to_vec(),
                    new_line.to_vec(),
                    CHUNK_TYPE_TEXT,
                ));
            }
            // +1 for the newline
            old_offset += old_line.len() + 1;
            new_offset += new_line.len() + 1;
        }

        if old_lines.len() != new_lines.len() {
            // Both offsets point one past the newline that follows the last
            // paired line; the tail starts at that newline.
            let old_tail = old_offset - 1;
            let new_tail = new_offset - 1;
            chunks.push(DiffChunk::new(
                old_tail as u64,
                old[old_tail..].to_vec(),
                new[new_tail..].to_vec(),
                CHUNK_TYPE_TEXT,
            ));
        }

        chunks
    }
}

impl FileHandler for TextDeltaHandler {
    fn compare(&self, old: &[u8], new: &[u8]) -> Result<Vec<DiffChunk>, RDeltaError> {
        Ok(TextDeltaHandler::compare(self, old, new))
    }

    fn apply(&self, original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
        replay_chunks(original, chunks)
    }

    fn file_type(&self) -> &str {
        CHUNK_TYPE_TEXT
    }
}
