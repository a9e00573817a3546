//! Bundle writer: buffers entries, then emits header + entries through zstd.

use std::io::Write;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::{debug, trace};

use crate::distribution::DistributionSet;
use crate::error::{PatchError, Result};
use crate::patch_format::{encode_flags, validate_path, Operation, PatchRecord, MAGIC};
use crate::pool::BufferPool;

/// zstd level for bundle streams.
pub const COMPRESSION_LEVEL: i32 = 19;

pub struct BundleWriter<W: Write> {
    inner: Option<W>,
    declared: DistributionSet,
    entries: Vec<u8>,
    entry_count: u32,
    closed: bool,
    pool: Arc<BufferPool>,
}

impl<W: Write> BundleWriter<W> {
    /// Start a bundle targeting `declared`, which must not be empty.
    pub fn new(inner: W, declared: DistributionSet) -> Result<Self> {
        Self::with_pool(inner, declared, Arc::new(BufferPool::new()))
    }

    pub fn with_pool(inner: W, declared: DistributionSet, pool: Arc<BufferPool>) -> Result<Self> {
        if declared.is_empty() {
            return Err(PatchError::Usage(
                "Bundle must declare at least one distribution".into(),
            ));
        }
        let entries = pool.take(64 * 1024);
        Ok(Self {
            inner: Some(inner),
            declared,
            entries,
            entry_count: 0,
            closed: false,
            pool,
        })
    }

    pub fn declared_distributions(&self) -> DistributionSet {
        self.declared
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn write_create(&mut self, path: &str, dists: DistributionSet, content: &[u8]) -> Result<()> {
        self.write_entry(Operation::Create, path, dists, None, content)
    }

    pub fn write_modify(
        &mut self,
        path: &str,
        dists: DistributionSet,
        base_checksum: u32,
        delta: &[u8],
    ) -> Result<()> {
        self.write_entry(Operation::Modify, path, dists, Some(base_checksum), delta)
    }

    pub fn write_remove(&mut self, path: &str, dists: DistributionSet) -> Result<()> {
        self.write_entry(Operation::Remove, path, dists, None, &[])
    }

    /// Write an already-built record.
    pub fn write_record(&mut self, record: &PatchRecord) -> Result<()> {
        let dists = record.distributions;
        let path = record.target_path.as_str();
        match record.operation {
            Operation::Create => self.write_create(path, dists, &record.data),
            Operation::Modify => {
                let checksum = record.base_checksum.ok_or_else(|| {
                    PatchError::Usage(format!("MODIFY record for {path} has no base checksum"))
                })?;
                self.write_modify(path, dists, checksum, &record.data)
            }
            Operation::Remove => {
                if !record.data.is_empty() {
                    return Err(PatchError::Usage(format!(
                        "REMOVE record for {path} carries {} payload bytes",
                        record.data.len()
                    )));
                }
                self.write_remove(path, dists)
            }
        }
    }

    fn write_entry(
        &mut self,
        op: Operation,
        path: &str,
        dists: DistributionSet,
        checksum: Option<u32>,
        data: &[u8],
    ) -> Result<()> {
        if self.closed {
            return Err(PatchError::Usage(format!(
                "Cannot write {path}: bundle writer is closed"
            )));
        }
        if dists.is_empty() {
            return Err(PatchError::Usage(format!(
                "Entry {path} has no distributions"
            )));
        }
        if !dists.is_subset_of(self.declared) {
            return Err(PatchError::Usage(format!(
                "Entry {path} targets {dists}, bundle declares only {}",
                self.declared
            )));
        }
        validate_path(path)?;
        let data_len = i32::try_from(data.len()).map_err(|_| {
            PatchError::Usage(format!(
                "Entry {path} payload of {} bytes exceeds {} bytes",
                data.len(),
                i32::MAX
            ))
        })?;
        if self.entry_count == i32::MAX as u32 {
            return Err(PatchError::Usage("Bundle entry limit reached".into()));
        }

        let buf = &mut self.entries;
        buf.push(encode_flags(op, dists));
        buf.write_u16::<BigEndian>(path.len() as u16)?;
        buf.extend_from_slice(path.as_bytes());
        if let Some(checksum) = checksum {
            buf.write_i32::<BigEndian>(checksum as i32)?;
        }
        buf.write_i32::<BigEndian>(data_len)?;
        buf.extend_from_slice(data);

        self.entry_count += 1;
        trace!("Buffered {} {} for {} ({} bytes)", op, path, dists, data.len());
        Ok(())
    }

    /// Emit the bundle. A second call does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let entries = std::mem::take(&mut self.entries);

        let (count, declared) = (self.entry_count, self.declared);
        let result = match self.inner.as_mut() {
            Some(inner) => emit(inner, count, declared, &entries),
            None => Ok(()),
        };
        self.pool.give(entries);
        result
    }

    /// Close and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        self.inner
            .take()
            .ok_or_else(|| PatchError::Usage("Bundle writer already released".into()))
    }
}

fn emit<W: Write>(
    inner: &mut W,
    entry_count: u32,
    declared: DistributionSet,
    entries: &[u8],
) -> Result<()> {
    let mut encoder = zstd::Encoder::new(&mut *inner, COMPRESSION_LEVEL)?;
    encoder.write_all(MAGIC)?;
    encoder.write_i32::<BigEndian>(entry_count as i32)?;
    encoder.write_u8(declared.to_bitfield())?;
    encoder.write_all(entries)?;
    encoder.finish()?;
    inner.flush()?;

    debug!(
        "Wrote bundle: {} entries for {} ({} raw bytes)",
        entry_count,
        declared,
        entries.len() + MAGIC.len() + 5
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;

    fn client() -> DistributionSet {
        DistributionSet::single(Distribution::Client)
    }

    #[test]
    fn test_empty_declared_set_rejected() {
        let err = BundleWriter::new(Vec::new(), DistributionSet::empty()).err().unwrap();
        assert!(matches!(err, PatchError::Usage(_)));
    }

    #[test]
    fn test_entry_counter() {
        let mut writer = BundleWriter::new(Vec::new(), DistributionSet::all()).unwrap();
        assert_eq!(writer.declared_distributions(), DistributionSet::all());
        writer.write_create("a.txt", client(), b"X").unwrap();
        writer.write_modify("b.txt", client(), 0xFFFF_FFFF, b"delta").unwrap();
        writer.write_remove("c.txt", client()).unwrap();
        assert_eq!(writer.entry_count(), 3);
    }

    #[test]
    fn test_subset_enforced_before_buffering() {
        let mut writer = BundleWriter::new(Vec::new(), client()).unwrap();
        let server = DistributionSet::single(Distribution::Server);

        let err = writer.write_create("a.txt", server, b"X").unwrap_err();
        assert!(matches!(err, PatchError::Usage(_)));
        assert!(writer.entries.is_empty());
        assert_eq!(writer.entry_count(), 0);

        assert!(writer
            .write_create("a.txt", DistributionSet::empty(), b"X")
            .is_err());
        assert!(writer.entries.is_empty());
    }

    #[test]
    fn test_invalid_path_rejected() {
        let mut writer = BundleWriter::new(Vec::new(), client()).unwrap();
        for path in ["", "a//b", "./a", "a/..", "bad\u{1}"] {
            let err = writer.write_remove(path, client()).unwrap_err();
            assert!(matches!(err, PatchError::InvalidPath { .. }), "{path:?}");
        }
        assert_eq!(writer.entry_count(), 0);
    }

    #[test]
    fn test_close_idempotent_and_write_after_close_fails() {
        let mut writer = BundleWriter::new(Vec::new(), client()).unwrap();
        writer.write_create("a.txt", client(), b"X").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());

        let err = writer.write_remove("a.txt", client()).unwrap_err();
        assert!(matches!(err, PatchError::Usage(_)));

        let bytes = writer.finish().unwrap();
        let raw = zstd::decode_all(bytes.as_slice()).unwrap();
        assert_eq!(&raw[..8], MAGIC);
        assert_eq!(&raw[8..12], &[0, 0, 0, 1]);
        assert_eq!(raw[12], 0b001);
    }

    #[test]
    fn test_entry_layout() {
        let mut writer = BundleWriter::new(Vec::new(), DistributionSet::all()).unwrap();
        writer.write_modify("ab", client(), 0x8000_0001, b"Z").unwrap();
        let raw = zstd::decode_all(writer.finish().unwrap().as_slice()).unwrap();

        let entry = &raw[13..];
        assert_eq!(
            entry,
            &[
                0b0000_1001, // MODIFY | client
                0, 2, b'a', b'b',
                0x80, 0, 0, 1, // checksum, unsigned bits
                0, 0, 0, 1, b'Z',
            ]
        );
    }

    #[test]
    fn test_remove_record_with_payload_rejected() {
        let mut writer = BundleWriter::new(Vec::new(), client()).unwrap();
        let mut record = PatchRecord::remove("a.txt", client());
        record.data = vec![1];
        assert!(writer.write_record(&record).is_err());
        assert_eq!(writer.entry_count(), 0);
    }

    #[test]
    fn test_pool_receives_entry_buffer() {
        let pool = Arc::new(BufferPool::new());
        let mut writer = BundleWriter::with_pool(Vec::new(), client(), pool.clone()).unwrap();
        assert_eq!(pool.pooled(), 0);
        writer.close().unwrap();
        assert_eq!(pool.pooled(), 1);
    }
}
