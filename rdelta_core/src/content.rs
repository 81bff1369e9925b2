//! SHA-256 content hashing and gzip payload compression.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rdelta_common::RDeltaError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Hex-encoded SHA-256 of a byte buffer
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex-encoded SHA-256 of a file, streamed
pub fn hash_file(path: &Path) -> Result<String, RDeltaError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024]; // 64KB buffer

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Gzip `data` at `level` (1-9)
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, RDeltaError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| RDeltaError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| RDeltaError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, RDeltaError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| RDeltaError::Compression(e.to_string()))?;
    Ok(out)
}
