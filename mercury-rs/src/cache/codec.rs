//! Provides the binary format used to snapshot the cache onto disk.
//!
//! The format is intentionally simple: all integers are 4 byte little endian values and all
//! strings or byte arrays are prefixed with their length (again as 4 byte value). A snapshot
//! file starts with the number of records, followed by the records themselves:
//!
//! ```text
//! record count (u32)
//! [ primary (str) | secondary (str) | type tag (u8) | response fields... ] * record count
//! ```
//!
//! The fields of each response are written by [CachedResponse::encode]. Reading a snapshot is
//! all-or-nothing: any malformed or truncated input yields an error and no records at all.
use crate::cache::entry::CacheEntry;
use crate::cache::response::CachedResponse;
use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Writes the primitive values of the snapshot format into a growing buffer.
#[derive(Default)]
pub struct Encoder {
    buffer: BytesMut,
}

impl Encoder {
    /// Creates a new and empty encoder.
    pub fn new() -> Self {
        Encoder {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Writes a signed 4 byte integer.
    pub fn write_int(&mut self, value: i32) {
        self.buffer.put_i32_le(value);
    }

    /// Writes a length or count as unsigned 4 byte integer.
    ///
    /// # Errors
    /// Fails if the value doesn't fit into 4 bytes.
    pub fn write_len(&mut self, len: usize) -> anyhow::Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| anyhow::anyhow!("Cannot encode a length of {} bytes/items", len))?;
        self.buffer.put_u32_le(len);
        Ok(())
    }

    /// Writes the given bytes prefixed with their length.
    pub fn write_bytes(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.write_len(data.len())?;
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Writes the given string as UTF-8 prefixed with its length.
    pub fn write_str(&mut self, value: &str) -> anyhow::Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Returns the encoded data.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

/// Reads the primitive values of the snapshot format.
///
/// Each read verifies that enough data is available, therefore a truncated input is reported as
/// error instead of a panic.
pub struct Decoder {
    data: Bytes,
}

impl Decoder {
    /// Creates a decoder which reads the given data.
    pub fn new(data: Bytes) -> Self {
        Decoder { data }
    }

    fn ensure(&self, required: usize) -> anyhow::Result<()> {
        if self.data.remaining() < required {
            Err(anyhow::anyhow!(
                "Unexpected end of data: {} bytes required but only {} are left",
                required,
                self.data.remaining()
            ))
        } else {
            Ok(())
        }
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    /// Reads a signed 4 byte integer.
    pub fn read_int(&mut self) -> anyhow::Result<i32> {
        self.ensure(4)?;
        Ok(self.data.get_i32_le())
    }

    /// Reads a length or count.
    pub fn read_len(&mut self) -> anyhow::Result<usize> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le() as usize)
    }

    /// Reads a length prefixed byte array.
    ///
    /// Note that this doesn't copy any data, as the result shares the underlying buffer.
    pub fn read_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.read_len()?;
        self.ensure(len)?;
        Ok(self.data.split_to(len))
    }

    /// Reads a length prefixed UTF-8 string.
    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let data = self.read_bytes()?;
        String::from_utf8(data.to_vec()).context("Invalid UTF-8 string in snapshot")
    }

    /// Determines if all data has been consumed.
    pub fn is_empty(&self) -> bool {
        !self.data.has_remaining()
    }
}

/// Represents a single record of a snapshot file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// The primary key of the entry.
    pub primary: String,
    /// The secondary key of the entry.
    pub secondary: String,
    /// The cached response.
    pub response: Arc<CachedResponse>,
}

impl From<&Arc<CacheEntry>> for SnapshotRecord {
    fn from(entry: &Arc<CacheEntry>) -> Self {
        SnapshotRecord {
            primary: entry.primary().to_owned(),
            secondary: entry.secondary().to_owned(),
            response: entry.response().clone(),
        }
    }
}

/// Encodes the given records into the snapshot format.
pub fn encode_snapshot(records: &[SnapshotRecord]) -> anyhow::Result<Bytes> {
    let mut encoder = Encoder::new();
    encoder.write_len(records.len())?;
    for record in records {
        encoder.write_str(&record.primary)?;
        encoder.write_str(&record.secondary)?;
        record.response.encode(&mut encoder).with_context(|| {
            format!(
                "Failed to encode the response for {} / {}",
                record.primary, record.secondary
            )
        })?;
    }

    Ok(encoder.into_bytes())
}

/// Decodes a complete snapshot.
///
/// # Errors
/// Fails if the data is truncated, contains an unknown tag or has trailing data.
pub fn decode_snapshot(data: Bytes) -> anyhow::Result<Vec<SnapshotRecord>> {
    let mut decoder = Decoder::new(data);
    let count = decoder.read_len()?;

    // The count is only a hint, a broken header must not trigger a huge allocation...
    let mut records = Vec::with_capacity(count.min(64 * 1024));
    for index in 0..count {
        let primary = decoder.read_string()?;
        let secondary = decoder.read_string()?;
        let response = CachedResponse::decode(&mut decoder)
            .with_context(|| format!("Failed to decode record {} ({})", index, primary))?;
        records.push(SnapshotRecord {
            primary,
            secondary,
            response: Arc::new(response),
        });
    }

    if !decoder.is_empty() {
        return Err(anyhow::anyhow!(
            "Snapshot contains trailing data after {} records",
            count
        ));
    }

    Ok(records)
}

/// Writes the given records into the given file.
///
/// The data is first written into a temporary file next to the target, which is then renamed.
/// Therefore, a crash during a save never leaves a truncated snapshot behind. Each call uses its
/// own temporary file, so that concurrent saves of the same snapshot don't interfere.
pub async fn write_snapshot(path: &Path, records: &[SnapshotRecord]) -> anyhow::Result<()> {
    let data = encode_snapshot(records)?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Cannot create directory {}", parent.display()))?;
    }

    let temp_path = temp_path(path);
    tokio::fs::write(&temp_path, &data)
        .await
        .with_context(|| format!("Cannot write snapshot to {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Cannot move snapshot into place at {}", path.display()))?;

    Ok(())
}

/// Reads and decodes the given snapshot file.
pub async fn read_snapshot(path: &Path) -> anyhow::Result<Vec<SnapshotRecord>> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Cannot read snapshot {}", path.display()))?;

    decode_snapshot(Bytes::from(data))
        .with_context(|| format!("Cannot decode snapshot {}", path.display()))
}

fn temp_path(path: &Path) -> PathBuf {
    static NEXT_WRITE: AtomicU64 = AtomicU64::new(1);

    let mut file_name = path.as_os_str().to_owned();
    file_name.push(format!(
        ".{}-{}.tmp",
        std::process::id(),
        NEXT_WRITE.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(file_name)
}
