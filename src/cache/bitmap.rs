//! Persisted chunk bitmap.
//!
//! Tracks which fixed-size chunks of a file have been written locally.
//! Bit *i* is set exactly when chunk *i* is complete on disk; bits are
//! monotone and never clear.
//!
//! # On-disk format
//!
//! The bitmap persists to a sidecar file next to the data file:
//! raw bit-vector bytes followed by an 8-byte little-endian total file
//! size footer. A bitmap file shorter than the bit count implies the
//! trailing bits are zero, so a torn write loses progress but never
//! claims chunks that were not persisted.

use std::io;
use std::path::Path;
use tokio::fs;

/// Number of bytes in the size footer.
const FOOTER_LEN: usize = 8;

/// Bit vector over the chunks of a file of known total size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: Vec<u8>,
    num_chunks: u64,
    file_size: u64,
}

impl ChunkBitmap {
    /// Create an all-zero bitmap for a file of `file_size` bytes split
    /// into chunks of `chunk_size`.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let num_chunks = file_size.div_ceil(chunk_size);
        let num_bytes = (num_chunks.div_ceil(8)) as usize;
        Self {
            bits: vec![0u8; num_bytes],
            num_chunks,
            file_size,
        }
    }

    /// Whether bit `chunk` is set. Out-of-range chunks read as unset.
    pub fn test(&self, chunk: u64) -> bool {
        if chunk >= self.num_chunks {
            return false;
        }
        let byte = (chunk / 8) as usize;
        let mask = 1u8 << (chunk % 8);
        byte < self.bits.len() && self.bits[byte] & mask != 0
    }

    /// Set bit `chunk`. Setting is monotone; there is no clear.
    pub fn set(&mut self, chunk: u64) {
        if chunk >= self.num_chunks {
            return;
        }
        let byte = (chunk / 8) as usize;
        self.bits[byte] |= 1u8 << (chunk % 8);
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Whether every chunk is persisted.
    pub fn is_complete(&self) -> bool {
        self.count() == self.num_chunks
    }

    /// Total size of the tracked file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of chunks the file divides into.
    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Serialize to the sidecar format: bits followed by the size footer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.bits.clone();
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out
    }

    /// Parse the sidecar format. A short bit section is padded with zero
    /// bits; anything without a complete footer is rejected.
    pub fn from_bytes(bytes: &[u8], chunk_size: u64) -> io::Result<Self> {
        if bytes.len() < FOOTER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "bitmap sidecar smaller than its size footer",
            ));
        }
        let (bit_bytes, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);
        let file_size = u64::from_le_bytes(footer.try_into().expect("footer is 8 bytes"));

        let mut bitmap = Self::new(file_size, chunk_size);
        let n = bit_bytes.len().min(bitmap.bits.len());
        bitmap.bits[..n].copy_from_slice(&bit_bytes[..n]);
        // Trailing garbage bits beyond num_chunks must not inflate count().
        bitmap.clear_tail();
        Ok(bitmap)
    }

    /// Write the bitmap to `path` atomically (temp file + rename).
    pub async fn persist(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("bits.tmp");
        fs::write(&tmp, self.to_bytes()).await?;
        fs::rename(&tmp, path).await
    }

    /// Load a bitmap from `path`. Returns `Ok(None)` if the sidecar does
    /// not exist.
    pub async fn load(path: &Path, chunk_size: u64) -> io::Result<Option<Self>> {
        match fs::read(path).await {
            Ok(bytes) => Self::from_bytes(&bytes, chunk_size).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_tail(&mut self) {
        let tail_bits = (self.num_chunks % 8) as u8;
        if tail_bits != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << tail_bits) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn set_and_test() {
        let mut b = ChunkBitmap::new(10 * MIB, MIB);
        assert_eq!(b.num_chunks(), 10);
        assert!(!b.test(0));

        b.set(0);
        b.set(9);
        assert!(b.test(0));
        assert!(b.test(9));
        assert!(!b.test(5));
        assert_eq!(b.count(), 2);

        // Out-of-range bits are ignored.
        b.set(10);
        assert!(!b.test(10));
        assert_eq!(b.count(), 2);
    }

    #[test]
    fn partial_last_chunk_rounds_up() {
        let b = ChunkBitmap::new(1_500_000, MIB);
        assert_eq!(b.num_chunks(), 2);
    }

    #[test]
    fn zero_size_file_has_no_chunks() {
        let b = ChunkBitmap::new(0, MIB);
        assert_eq!(b.num_chunks(), 0);
        assert!(b.is_complete());
    }

    #[test]
    fn short_sidecar_reads_as_zero_bits() {
        let mut b = ChunkBitmap::new(100 * MIB, MIB);
        for i in 0..100 {
            b.set(i);
        }
        let mut bytes = b.to_bytes();
        // Drop the first half of the bit section; keep the footer intact.
        let footer: Vec<u8> = bytes.split_off(bytes.len() - FOOTER_LEN);
        bytes.truncate(bytes.len() / 2);
        bytes.extend_from_slice(&footer);

        let loaded = ChunkBitmap::from_bytes(&bytes, MIB).unwrap();
        assert_eq!(loaded.file_size(), 100 * MIB);
        assert!(loaded.count() < 100);
        // Surviving prefix bits are intact.
        assert!(loaded.test(0));
    }

    #[test]
    fn sidecar_without_footer_is_rejected() {
        assert!(ChunkBitmap::from_bytes(&[0u8; 7], MIB).is_err());
    }

    #[tokio::test]
    async fn persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bits");

        let mut b = ChunkBitmap::new(3 * MIB + 17, MIB);
        b.set(1);
        b.set(3);
        b.persist(&path).await.unwrap();

        let loaded = ChunkBitmap::load(&path, MIB).await.unwrap().unwrap();
        assert_eq!(loaded, b);

        // Load is idempotent.
        let again = ChunkBitmap::load(&path, MIB).await.unwrap().unwrap();
        assert_eq!(again, loaded);
    }

    #[tokio::test]
    async fn load_missing_sidecar_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ChunkBitmap::load(&dir.path().join("absent.bits"), MIB)
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    proptest! {
        #[test]
        fn byte_roundtrip(file_size in 0u64..64 * 1024, chunks in prop::collection::vec(0u64..64, 0..32)) {
            let chunk_size = 1024u64;
            let mut b = ChunkBitmap::new(file_size, chunk_size);
            for c in chunks {
                b.set(c);
            }
            let loaded = ChunkBitmap::from_bytes(&b.to_bytes(), chunk_size).unwrap();
            prop_assert_eq!(loaded, b);
        }

        #[test]
        fn count_matches_distinct_sets(chunks in prop::collection::hash_set(0u64..128, 0..64)) {
            let chunk_size = 1024u64;
            let mut b = ChunkBitmap::new(128 * chunk_size, chunk_size);
            for &c in &chunks {
                b.set(c);
            }
            prop_assert_eq!(b.count(), chunks.len() as u64);
        }
    }
}
