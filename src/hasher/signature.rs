use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::hash::Hasher as _;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use twox_hash::XxHash64;

/// Full-content hash algorithm. Quick signatures always use XxHash64 — they
/// are a cheap filter, not an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    XxHash64,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::XxHash64 => "xxhash64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blake3" => Some(HashAlgorithm::Blake3),
            "xxhash64" => Some(HashAlgorithm::XxHash64),
            _ => None,
        }
    }
}

/// Content signature of one file.
///
/// `quick` covers a fixed-size prefix plus the file size; `full` covers the
/// whole byte stream and is computed lazily, only when a quick bucket holds
/// more than one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub quick: u64,
    pub full: Option<Vec<u8>>,
    pub algorithm: HashAlgorithm,
}

impl Signature {
    pub fn full_hex(&self) -> Option<String> {
        self.full.as_ref().map(|bytes| hex_encode(bytes))
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

enum ContentHasher {
    Blake3(Box<blake3::Hasher>),
    XxHash64(XxHash64),
}

impl ContentHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::XxHash64 => ContentHasher::XxHash64(XxHash64::with_seed(0)),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Blake3(h) => {
                h.update(data);
            }
            ContentHasher::XxHash64(h) => h.write(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            ContentHasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
            ContentHasher::XxHash64(h) => h.finish().to_be_bytes().to_vec(),
        }
    }
}

/// Quick signature: XxHash64 over the first `prefix_len` bytes concatenated
/// with the file size. Deterministic for identical content and size.
pub fn quick_signature(path: &Path, size: u64, prefix_len: usize) -> std::io::Result<u64> {
    let mut f = File::open(path)?;
    let mut buffer = vec![0; prefix_len];
    let mut filled = 0;
    // Loop until EOF or the buffer is full; a single read() may come up short.
    while filled < buffer.len() {
        let n = f.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);

    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&buffer);
    hasher.write(&size.to_le_bytes());
    Ok(hasher.finish())
}

/// Full-content signature, streamed in `chunk_size` reads. Files at or above
/// `large_file_threshold` go through a memory map instead; the result is
/// byte-identical either way because both paths feed the hasher the same
/// byte stream.
pub fn full_signature(
    path: &Path,
    size: u64,
    algorithm: HashAlgorithm,
    chunk_size: usize,
    large_file_threshold: u64,
    timeout: Option<std::time::Duration>,
) -> Result<Vec<u8>> {
    let started = Instant::now();
    if size >= large_file_threshold {
        full_signature_mmap(path, algorithm, chunk_size, timeout, started)
    } else {
        full_signature_buffered(path, algorithm, chunk_size, timeout, started)
    }
}

fn check_deadline(started: Instant, timeout: Option<std::time::Duration>) -> Result<()> {
    if let Some(limit) = timeout {
        if started.elapsed() >= limit {
            return Err(Error::Timeout {
                what: "content hashing",
            });
        }
    }
    Ok(())
}

fn full_signature_buffered(
    path: &Path,
    algorithm: HashAlgorithm,
    chunk_size: usize,
    timeout: Option<std::time::Duration>,
    started: Instant,
) -> Result<Vec<u8>> {
    let mut f = File::open(path).map_err(|source| Error::Hash {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buffer = vec![0; chunk_size.max(1)];

    loop {
        check_deadline(started, timeout)?;
        let n = f.read(&mut buffer).map_err(|source| Error::Hash {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

fn full_signature_mmap(
    path: &Path,
    algorithm: HashAlgorithm,
    chunk_size: usize,
    timeout: Option<std::time::Duration>,
    started: Instant,
) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|source| Error::Hash {
        path: path.to_path_buf(),
        source,
    })?;
    // Safety: the map is read-only and dropped before this function returns.
    // A concurrent truncation would fault; the scan treats that like any
    // other mid-read failure and excludes the file.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| Error::Hash {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = ContentHasher::new(algorithm);
    for chunk in mmap.chunks(chunk_size.max(1)) {
        check_deadline(started, timeout)?;
        hasher.update(chunk);
    }
    Ok(hasher.finalize())
}
