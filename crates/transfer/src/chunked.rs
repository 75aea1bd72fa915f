use std::io::{Read, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{LARGE_FILE_THRESHOLD, TransferError};

/// Chunk count the size doubling aims for (roughly one progress step each).
const TARGET_CHUNK_COUNT: u64 = 50;

const SMALL_DEFAULT_CHUNK: u64 = 64 * 1024;
const SMALL_MAX_CHUNK: u64 = 1024 * 1024;
const LARGE_DEFAULT_CHUNK: u64 = 256 * 1024;
const LARGE_MAX_CHUNK: u64 = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file. Returns the hex-encoded digest and
/// the number of bytes hashed.
///
/// Blocking; call it from `spawn_blocking` in async code.
pub fn calculate_file_checksum(path: &Path) -> Result<(String, u64), TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), len))
}

// ---------------------------------------------------------------------------
// ChunkPlan
// ---------------------------------------------------------------------------

/// Chunk size chosen for one file.
///
/// Starts from a default and doubles until the file splits into at most
/// [`TARGET_CHUNK_COUNT`] chunks, never exceeding the maximum. Files above
/// [`LARGE_FILE_THRESHOLD`] start from a larger default and may grow to a
/// larger maximum. The plan depends only on the file size, so a resumed
/// transfer always reuses the chunk size of the interrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
}

impl ChunkPlan {
    pub fn for_file(size: u64) -> Self {
        if size > LARGE_FILE_THRESHOLD {
            Self::grow(size, LARGE_DEFAULT_CHUNK, LARGE_MAX_CHUNK)
        } else {
            Self::grow(size, SMALL_DEFAULT_CHUNK, SMALL_MAX_CHUNK)
        }
    }

    fn grow(size: u64, default: u64, max: u64) -> Self {
        let mut chunk_size = default;
        while size / chunk_size > TARGET_CHUNK_COUNT && chunk_size < max {
            chunk_size = (chunk_size * 2).min(max);
        }
        Self { chunk_size }
    }

    /// Number of chunks needed for `size` bytes.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size)
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// A contiguous byte range of a file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the file.
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads a file in fixed-size chunks.
///
/// Every chunk but the last is exactly `chunk_size` bytes; a file that
/// shrinks while being read yields an I/O error rather than a short chunk.
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: u64,
    offset: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            offset: 0,
            file_size,
        })
    }

    /// Seeks to the given byte offset (for resume).
    pub async fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size) as usize;
        let mut data = vec![0u8; read_size];
        self.file.read_exact(&mut data).await?;

        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += read_size as u64;
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes, as seen when the file was opened.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[test]
    fn calculate_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"test content for checksum";
        let path = create_test_file(dir.path(), "test.bin", data);
        let (sum, len) = calculate_file_checksum(&path).unwrap();
        assert_eq!(sum, checksum_bytes(data));
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn plan_for_fifty_mib_grows_to_fifty_chunks() {
        let size = 50 * MIB;
        let plan = ChunkPlan::for_file(size);
        // 256 KiB → 512 KiB → 1 MiB: 50 MiB / 1 MiB is no longer above 50.
        assert_eq!(plan.chunk_size, MIB);
        assert_eq!(plan.chunk_count(size), 50);
        assert!(plan.chunk_size > LARGE_DEFAULT_CHUNK);
        assert!(plan.chunk_size <= LARGE_MAX_CHUNK);
    }

    #[test]
    fn plan_keeps_default_for_tiny_files() {
        assert_eq!(ChunkPlan::for_file(10).chunk_size, SMALL_DEFAULT_CHUNK);
        assert_eq!(ChunkPlan::for_file(SMALL_DEFAULT_CHUNK * 50).chunk_size, SMALL_DEFAULT_CHUNK);
    }

    #[test]
    fn plan_small_file_at_threshold() {
        // 10 MiB / 50 ≈ 205 KiB, so the small default doubles to 256 KiB.
        let plan = ChunkPlan::for_file(LARGE_FILE_THRESHOLD);
        assert_eq!(plan.chunk_size, 256 * 1024);
        assert!(plan.chunk_count(LARGE_FILE_THRESHOLD) <= TARGET_CHUNK_COUNT);
    }

    #[test]
    fn plan_large_files_use_larger_default() {
        let just_large = ChunkPlan::for_file(LARGE_FILE_THRESHOLD + 1);
        let just_small = ChunkPlan::for_file(LARGE_FILE_THRESHOLD);
        assert!(just_large.chunk_size >= just_small.chunk_size);
        assert!(LARGE_DEFAULT_CHUNK > SMALL_DEFAULT_CHUNK);
    }

    #[test]
    fn plan_is_capped() {
        let huge = 1024 * 1024 * MIB; // 1 TiB
        let plan = ChunkPlan::for_file(huge);
        assert_eq!(plan.chunk_size, LARGE_MAX_CHUNK);
        assert!(plan.chunk_count(huge) > TARGET_CHUNK_COUNT);
    }

    #[test]
    fn plan_chunk_sizes_are_powers_of_two_multiples() {
        for size in [11 * MIB, 100 * MIB, 3 * 1024 * MIB] {
            let plan = ChunkPlan::for_file(size);
            assert_eq!(plan.chunk_size % LARGE_DEFAULT_CHUNK, 0);
            assert!((plan.chunk_size / LARGE_DEFAULT_CHUNK).is_power_of_two());
        }
    }

    #[tokio::test]
    async fn chunk_reader_reads_all() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::open(&path, 4).await.unwrap();
        assert_eq!(reader.file_size(), 10);
        assert_eq!(reader.remaining(), 10);

        let c1 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c1.offset, 0);
        assert_eq!(&c1.data, b"AABB");
        assert_eq!(reader.remaining(), 6);

        let c2 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c2.offset, 4);
        assert_eq!(&c2.data, b"CCDD");

        let c3 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c3.offset, 8);
        assert_eq!(c3.len(), 2);
        assert_eq!(&c3.data, b"EE");

        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_reader_seek_and_resume() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");

        let mut reader = ChunkReader::open(&path, 4).await.unwrap();
        reader.seek_to(6).await.unwrap();
        assert_eq!(reader.offset(), 6);
        assert_eq!(reader.remaining(), 4);

        let c = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c.offset, 6);
        assert_eq!(&c.data, b"6789");

        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_reader_missing_file() {
        let result = ChunkReader::open(Path::new("/nonexistent/file.bin"), 4).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }
}
