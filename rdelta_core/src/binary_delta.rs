//! Hash-indexed binary delta matcher.
//!
//! The old buffer is indexed at a fixed stride (`min_match_length`), the new
//! buffer is scanned at the same stride, and every hash hit is verified and
//! greedily extended byte by byte. Accepted matches form a chain that is
//! strictly increasing in both buffers; the regions between them become
//! [`DiffChunk`]s that [`replay_chunks`] can apply to the old buffer.
//!
//! Matching is a heuristic: matches shorter than the stride, or not aligned
//! with it, are missed. Missed matches only make the delta larger, they never
//! make it wrong.

use crate::handler::{replay_chunks, FileHandler};
use rdelta_common::{DiffChunk, RDeltaError, CHUNK_TYPE_BINARY};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

pub const DEFAULT_MIN_MATCH_LENGTH: usize = 8;
pub const DEFAULT_MAX_GAP_SIZE: usize = 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const HIGH_ENTROPY: f64 = 0.8;
const MID_ENTROPY: f64 = 0.5;
const LARGE_INPUT: usize = 1024 * 1024;
const HUGE_INPUT: usize = 10 * 1024 * 1024;

/// Hash buckets of low-entropy data can hold thousands of offsets; only the
/// first few at or after the chain position are verified.
const MAX_CANDIDATE_PROBES: usize = 32;

/// Tunables for one matcher invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchParams {
    /// Stride and window length of the hash index; shortest match accepted
    pub min_match_length: usize,
    /// Widest gap two matches may be merged across
    pub max_gap_size: usize,
    /// Working chunk size for the input class
    pub chunk_size: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            min_match_length: DEFAULT_MIN_MATCH_LENGTH,
            max_gap_size: DEFAULT_MAX_GAP_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MatchParams {
    /// Parameters adapted to the byte distribution and size of `data`
    pub fn tuned_for(data: &[u8]) -> Self {
        Self::for_profile(calculate_entropy(data), data.len())
    }

    /// Near-random data gets long windows and narrow gaps so noise does not
    /// produce spurious short matches; repetitive data gets short windows
    /// and wide gaps. Large inputs widen the window to bound the index size.
    pub fn for_profile(entropy: f64, data_size: usize) -> Self {
        let mut params = if entropy > HIGH_ENTROPY {
            Self {
                min_match_length: 16,
                max_gap_size: 256,
                chunk_size: 8192,
            }
        } else if entropy > MID_ENTROPY {
            Self::default()
        } else {
            Self {
                min_match_length: 4,
                max_gap_size: 2048,
                chunk_size: 2048,
            }
        };

        if data_size > HUGE_INPUT {
            params.chunk_size *= 4;
            params.min_match_length += 8;
        } else if data_size > LARGE_INPUT {
            params.chunk_size *= 2;
            params.min_match_length += 4;
        }

        params
    }
}

/// Summary of the most recent [`BinaryDeltaMatcher::compare`] call
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryDiffStats {
    pub match_count: usize,
    pub total_matched_bytes: u64,
    pub largest_match: u64,
    pub smallest_match: u64,
    pub average_match_size: f64,
    /// `len(new) / total_matched_bytes`, or 1.0 when nothing matched
    pub compression_ratio: f64,
    /// Normalized Shannon entropy of the new buffer
    pub entropy: f64,
    pub chunk_count: usize,
    /// Parameters the call actually ran with
    pub params: MatchParams,
}

impl Default for BinaryDiffStats {
    fn default() -> Self {
        Self {
            match_count: 0,
            total_matched_bytes: 0,
            largest_match: 0,
            smallest_match: 0,
            average_match_size: 0.0,
            compression_ratio: 1.0,
            entropy: 0.0,
            chunk_count: 0,
            params: MatchParams::default(),
        }
    }
}

impl BinaryDiffStats {
    fn from_matches(
        matches: &[Match],
        new_len: usize,
        entropy: f64,
        chunk_count: usize,
        params: MatchParams,
    ) -> Self {
        let mut stats = Self {
            entropy,
            chunk_count,
            params,
            ..Default::default()
        };
        if matches.is_empty() {
            return stats;
        }

        let total: u64 = matches.iter().map(|m| m.length as u64).sum();
        stats.match_count = matches.len();
        stats.total_matched_bytes = total;
        stats.largest_match = matches.iter().map(|m| m.length as u64).max().unwrap_or(0);
        stats.smallest_match = matches.iter().map(|m| m.length as u64).min().unwrap_or(0);
        stats.average_match_size = total as f64 / matches.len() as f64;
        stats.compression_ratio = new_len as f64 / total as f64;
        stats
    }
}

/// A verified equal region: `old[old_offset..][..length] == new[new_offset..][..length]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Match {
    pub old_offset: usize,
    pub new_offset: usize,
    pub length: usize,
}

impl Match {
    fn old_end(&self) -> usize {
        self.old_offset + self.length
    }

    fn new_end(&self) -> usize {
        self.new_offset + self.length
    }
}

/// Binary delta handler, the fallback for unrecognized file types.
///
/// Safe to share between threads: each `compare` tunes its own parameters
/// and only the stats slot is written.
pub struct BinaryDeltaMatcher {
    params: MatchParams,
    adaptive: bool,
    stats: RwLock<BinaryDiffStats>,
}

impl BinaryDeltaMatcher {
    /// Matcher that tunes its parameters to each input
    pub fn new() -> Self {
        Self {
            params: MatchParams::default(),
            adaptive: true,
            stats: RwLock::new(BinaryDiffStats::default()),
        }
    }

    /// Matcher that always runs with `params`
    pub fn with_params(params: MatchParams) -> Self {
        Self {
            params,
            adaptive: false,
            stats: RwLock::new(BinaryDiffStats::default()),
        }
    }

    pub fn adaptive(mut self, enabled: bool) -> Self {
        self.adaptive = enabled;
        self
    }

    pub fn params(&self) -> MatchParams {
        self.params
    }

    /// Tune the parameters to a data sample and pin them: later `compare`
    /// calls stop adapting to their own input.
    pub fn optimize(&mut self, sample: &[u8]) {
        self.params = MatchParams::tuned_for(sample);
        self.adaptive = false;
    }

    /// Chunks that turn `old` into `new`; empty iff the buffers are equal
    pub fn compare(&self, old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
        let entropy = calculate_entropy(new);
        let params = if self.adaptive {
            MatchParams::for_profile(entropy, new.len())
        } else {
            self.params
        };

        if old == new {
            self.store_stats(BinaryDiffStats::from_matches(&[], new.len(), entropy, 0, params));
            return Vec::new();
        }

        let matches = find_matches(old, new, &params);
        let chunks = chunks_from_matches(old, new, &matches);

        debug!(
            "Binary delta: {} matches, {} chunks (window {}, gap {})",
            matches.len(),
            chunks.len(),
            params.min_match_length,
            params.max_gap_size
        );

        self.store_stats(BinaryDiffStats::from_matches(
            &matches,
            new.len(),
            entropy,
            chunks.len(),
            params,
        ));
        chunks
    }

    /// Replay `chunks` against `original`
    pub fn apply(&self, original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
        replay_chunks(original, chunks)
    }

    /// Stats of the most recent `compare` call
    pub fn latest_stats(&self) -> BinaryDiffStats {
        self.stats
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn store_stats(&self, stats: BinaryDiffStats) {
        if let Ok(mut slot) = self.stats.write() {
            *slot = stats;
        }
    }
}

impl Default for BinaryDeltaMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandler for BinaryDeltaMatcher {
    fn compare(&self, old: &[u8], new: &[u8]) -> Result<Vec<DiffChunk>, RDeltaError> {
        Ok(BinaryDeltaMatcher::compare(self, old, new))
    }

    fn apply(&self, original: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, RDeltaError> {
        BinaryDeltaMatcher::apply(self, original, chunks)
    }

    fn file_type(&self) -> &str {
        CHUNK_TYPE_BINARY
    }
}

/// Shannon entropy of the byte distribution, normalized to 0..=1
pub fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let entropy: f64 = counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum();

    (entropy / 8.0).clamp(0.0, 1.0)
}

/// Shift-add window hash in a wrapping 32-bit accumulator. Only used to
/// bucket offsets; every hit is verified against the actual bytes.
pub(crate) fn window_hash(window: &[u8]) -> u32 {
    window
        .iter()
        .fold(0u32, |hash, &byte| hash.wrapping_shl(1).wrapping_add(byte as u32))
}

fn extend_match(old: &[u8], new: &[u8]) -> usize {
    old.iter().zip(new).take_while(|(a, b)| a == b).count()
}

pub(crate) fn find_matches(old: &[u8], new: &[u8], params: &MatchParams) -> Vec<Match> {
    let window = params.min_match_length.max(1);
    if old.len() < window || new.len() < window {
        return Vec::new();
    }

    let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
    for offset in (0..=old.len() - window).step_by(window) {
        index
            .entry(window_hash(&old[offset..offset + window]))
            .or_default()
            .push(offset);
    }

    let mut matches = Vec::new();
    // Matches must not reach back before the previous one in `old`, or the
    // derived chunks would no longer replay in offset order.
    let mut old_floor = 0usize;
    let mut pos = 0usize;

    while pos + window <= new.len() {
        let hash = window_hash(&new[pos..pos + window]);
        let found = index.get(&hash).and_then(|offsets| {
            let first = offsets.partition_point(|&offset| offset < old_floor);
            offsets[first..]
                .iter()
                .take(MAX_CANDIDATE_PROBES)
                .map(|&offset| (offset, extend_match(&old[offset..], &new[pos..])))
                .find(|&(_, length)| length >= window)
        });

        match found {
            Some((old_offset, length)) => {
                matches.push(Match {
                    old_offset,
                    new_offset: pos,
                    length,
                });
                old_floor = old_offset + length;
                pos += length;
            }
            None => pos += window,
        }
    }

    merge_adjacent_matches(old, new, matches, params.max_gap_size)
}

/// Fold consecutive matches together when the gap between them is small on
/// both sides and the bridged bytes are identical in both buffers.
pub(crate) fn merge_adjacent_matches(
    old: &[u8],
    new: &[u8],
    matches: Vec<Match>,
    max_gap_size: usize,
) -> Vec<Match> {
    let mut merged = Vec::with_capacity(matches.len());
    let mut iter = matches.into_iter();
    let Some(mut current) = iter.next() else {
        return merged;
    };

    for next in iter {
        if can_bridge(old, new, &current, &next, max_gap_size) {
            current.length = next.new_end() - current.new_offset;
        } else {
            merged.push(current);
            current = next;
        }
    }
    merged.push(current);
    merged
}

// Matches are already extended as far as the bytes agree, so matches found by
// `find_matches` never leave an equal gap and this only fires for hand-built input.
fn can_bridge(old: &[u8], new: &[u8], current: &Match, next: &Match, max_gap_size: usize) -> bool {
    if next.old_offset < current.old_end() || next.new_offset < current.new_end() {
        return false;
    }

    let gap_old = next.old_offset - current.old_end();
    let gap_new = next.new_offset - current.new_end();
    if gap_old > max_gap_size || gap_new > max_gap_size {
        return false;
    }

    // A merged match claims equality across the gap, so the gap must sit on
    // the same diagonal and hold the same bytes.
    gap_old == gap_new && old[current.old_end()..next.old_offset] == new[current.new_end()..next.new_offset]
}

/// The complement of `matches`: one chunk per non-empty gap before each
/// match, plus a trailing chunk for whatever follows the last one.
pub(crate) fn chunks_from_matches(old: &[u8], new: &[u8], matches: &[Match]) -> Vec<DiffChunk> {
    let mut chunks = Vec::with_capacity(matches.len() + 1);
    let mut last_old = 0usize;
    let mut last_new = 0usize;

    for m in matches {
        if m.old_offset > last_old || m.new_offset > last_new {
            chunks.push(DiffChunk::new(
                last_old as u64,
                old[last_old..m.old_offset].to_vec(),
                new[last_new..m.new_offset].to_vec(),
                CHUNK_TYPE_BINARY,
            ));
        }
        last_old = m.old_end();
        last_new = m.new_end();
    }

    if last_old < old.len() || last_new < new.len() {
        chunks.push(DiffChunk::new(
            last_old as u64,
            old[last_old..].to_vec(),
            new[last_new..].to_vec(),
            CHUNK_TYPE_BINARY,
        ));
    }

    chunks
}
