//! Serializer/deserializer: primitive readers/writers over
//! a byte buffer, BSON object framing, and the common
//! `[u32 version][body][32-byte checksum]` file envelope used by shard,
//! leaf, and tree files alike.

use crate::errors::DbError;
use crate::storage::StoragePort;
use bson::Document;
use sha2::{Digest, Sha256};

/// Appends primitives to a growing byte buffer, little-endian throughout.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn push_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed (u32 LE) raw bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_u32_le(crate::num::usize_to_u32_saturating(bytes.len()));
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32 LE) UTF-8 string.
    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Length-prefixed BSON document.
    ///
    /// # Errors
    /// Returns an error if the document fails to serialize to BSON.
    pub fn push_bson(&mut self, doc: &bson::Document) -> Result<(), DbError> {
        let bytes = bson::to_vec(doc)?;
        self.push_bytes(&bytes);
        Ok(())
    }

    /// Raw bytes, unframed (caller controls length/position).
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Reads primitives from a byte slice, tracking a cursor.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.remaining() < n {
            return Err(DbError::IoError(format!(
                "unexpected end of buffer: wanted {n} bytes, had {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// # Errors
    /// Returns an error if fewer than 1 byte remains.
    pub fn read_u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    /// Reads exactly `n` unprefixed bytes.
    ///
    /// # Errors
    /// Returns an error if fewer than `n` bytes remain.
    pub fn read_raw(&mut self, n: usize) -> Result<Vec<u8>, DbError> {
        Ok(self.take(n)?.to_vec())
    }

    /// # Errors
    /// Returns an error if fewer than 4 bytes remain.
    pub fn read_u32_le(&mut self) -> Result<u32, DbError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// # Errors
    /// Returns an error if fewer than 8 bytes remain.
    pub fn read_u64_le(&mut self) -> Result<u64, DbError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// # Errors
    /// Returns an error if the length prefix or payload cannot be read.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DbError> {
        let len = self.read_u32_le()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// # Errors
    /// Returns an error if the bytes are not valid UTF-8 or cannot be read.
    pub fn read_str(&mut self) -> Result<String, DbError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| DbError::IoError(format!("invalid utf8 string: {e}")))
    }

    /// # Errors
    /// Returns an error if the bytes cannot be read or do not decode as BSON.
    pub fn read_bson(&mut self) -> Result<bson::Document, DbError> {
        let bytes = self.read_bytes()?;
        Ok(bson::from_slice(&bytes)?)
    }

    /// Remaining unread bytes, verbatim.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Computes the 32-byte checksum covering `version` (LE) concatenated with
/// `body`.
#[must_use]
pub fn checksum(version: u32, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(version.to_le_bytes());
    hasher.update(body);
    hasher.into()
}

/// Frames `body` as `[u32 version][body][32-byte checksum]`.
#[must_use]
pub fn frame(version: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len() + 32);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&checksum(version, body));
    out
}

/// Writes a framed file to storage.
///
/// # Errors
/// Returns an error if the write fails at the storage port.
pub async fn save(
    storage: &dyn StoragePort,
    path: &str,
    mime_type: &str,
    version: u32,
    body: &[u8],
) -> Result<(), DbError> {
    storage.write(path, mime_type, &frame(version, body)).await?;
    Ok(())
}

/// Result of validating a framed file against its checksum.
pub enum Framed {
    /// Checksum matched; `version` and `body` are the decoded fields.
    Valid { version: u32, body: Vec<u8> },
    /// Checksum did not match the trailing 32 bytes. Carries the full file
    /// bytes so a caller can attempt [`legacy_fallback`] before concluding
    /// the file is corrupt.
    ChecksumMismatch { raw: Vec<u8> },
}

/// Validates an in-memory framed buffer against its trailing checksum.
/// Shared by [`load`] (which first reads `bytes` from storage) and callers
/// that already hold framed bytes in memory, such as a leaf cache.
///
/// # Errors
/// Returns an error if `bytes` is too short to contain a version prefix and
/// checksum suffix.
pub fn validate(bytes: &[u8]) -> Result<Framed, DbError> {
    if bytes.len() < 4 + 32 {
        return Err(DbError::IoError("framed buffer too short".into()));
    }
    let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = bytes[4..bytes.len() - 32].to_vec();
    let trailer = &bytes[bytes.len() - 32..];
    if checksum(version, &body).as_slice() == trailer {
        Ok(Framed::Valid { version, body })
    } else {
        Ok(Framed::ChecksumMismatch { raw: bytes.to_vec() })
    }
}

/// Reads and validates a framed file. Returns `None` if the file does not
/// exist.
///
/// # Errors
/// Returns an error if the storage read fails or the file is too short to
/// contain a version prefix and checksum suffix.
pub async fn load(storage: &dyn StoragePort, path: &str) -> Result<Option<Framed>, DbError> {
    let Some(bytes) = storage.read(path).await? else {
        return Ok(None);
    };
    validate(&bytes).map(Some)
}

/// Attempts the legacy-format fallback decode mandated for a checksum
/// mismatch: trims the trailing 32-byte checksum and reparses what remains
/// as a single plain (unframed) BSON document — the one predecessor on-disk
/// shape this crate still recognizes, from before the compact byte-packed
/// body encoding replaced it. Returns `None` if that also fails to parse,
/// at which point the caller should treat the file as genuinely corrupt.
#[must_use]
pub fn legacy_fallback(raw: &[u8]) -> Option<Document> {
    if raw.len() < 32 {
        return None;
    }
    bson::from_slice(&raw[..raw.len() - 32]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;

    #[test]
    fn writer_reader_round_trip_primitives() {
        let mut w = ByteWriter::new();
        w.push_u8(7);
        w.push_u32_le(0xDEAD_BEEF);
        w.push_u64_le(0x1122_3344_5566_7788);
        w.push_str("héllo");
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64_le().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(r.read_str().unwrap(), "héllo");
        assert!(r.at_end());
    }

    #[test]
    fn bson_round_trips_through_length_prefix() {
        let mut doc = bson::Document::new();
        doc.insert("a", 1i32);
        doc.insert("b", "x");
        let mut w = ByteWriter::new();
        w.push_bson(&doc).unwrap();
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        let back = r.read_bson().unwrap();
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn save_load_round_trips_and_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        save(&storage, "f.dat", "application/octet-stream", 2, b"hello world").await.unwrap();
        match load(&storage, "f.dat").await.unwrap().unwrap() {
            Framed::Valid { version, body } => {
                assert_eq!(version, 2);
                assert_eq!(body, b"hello world");
            }
            Framed::ChecksumMismatch { .. } => panic!("expected valid frame"),
        }

        // Corrupt one body byte and confirm detection.
        let mut bytes = storage.read("f.dat").await.unwrap().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        storage.write("f.dat", "application/octet-stream", &bytes).await.unwrap();
        match load(&storage, "f.dat").await.unwrap().unwrap() {
            Framed::Valid { .. } => panic!("corruption not detected"),
            Framed::ChecksumMismatch { raw } => assert_eq!(raw.len(), bytes.len()),
        }
    }

    #[tokio::test]
    async fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(load(&storage, "nope.dat").await.unwrap().is_none());
    }

    #[test]
    fn legacy_fallback_recovers_a_plain_bson_document_after_trimming_the_checksum() {
        let mut doc = bson::Document::new();
        doc.insert("a", 1i32);
        let mut bytes = bson::to_vec(&doc).unwrap();
        bytes.extend_from_slice(&[0u8; 32]);
        let recovered = legacy_fallback(&bytes).unwrap();
        assert_eq!(recovered, doc);
    }

    #[test]
    fn legacy_fallback_returns_none_for_bytes_too_short_or_not_bson() {
        assert!(legacy_fallback(&[0u8; 16]).is_none());
        let mut garbage = vec![1, 2, 3, 4, 5, 6, 7, 8];
        garbage.extend_from_slice(&[0u8; 32]);
        assert!(legacy_fallback(&garbage).is_none());
    }
}
