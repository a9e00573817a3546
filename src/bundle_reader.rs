//! Forward-only bundle reader.
//!
//! The header is decoded on open; entries are decoded one at a time from the
//! zstd stream. There is exactly one cursor: `read_entry` and the `entries`
//! iterator share the same position, and the iterator can only be requested
//! once, before any manual read.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use tracing::{debug, trace};

use crate::distribution::DistributionSet;
use crate::error::{PatchError, Result};
use crate::patch_format::{decode_flags, validate_path_bytes, Operation, PatchRecord, MAGIC};
use crate::pool::BufferPool;

pub struct BundleReader<R: Read> {
    decoder: Option<zstd::Decoder<'static, BufReader<R>>>,
    declared: DistributionSet,
    entry_count: u32,
    entries_read: u32,
    closed: bool,
    cursor_taken: bool,
    /// Set once a decode error left the stream mid-entry.
    failed: bool,
    pool: Arc<BufferPool>,
}

impl BundleReader<File> {
    /// Open a bundle file.
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening bundle {}", path.display());
        Self::new(File::open(path)?)
    }
}

impl<R: Read> BundleReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        Self::with_pool(inner, Arc::new(BufferPool::new()))
    }

    pub fn with_pool(inner: R, pool: Arc<BufferPool>) -> Result<Self> {
        let mut decoder = zstd::Decoder::new(inner)?;

        let mut signature = [0u8; MAGIC.len()];
        decoder.read_exact(&mut signature).map_err(|e| {
            PatchError::Format(format!("Failed to read bundle signature: {e}"))
        })?;
        if &signature != MAGIC {
            return Err(PatchError::Format(format!(
                "Invalid signature: expected {:?}, got {:?}",
                String::from_utf8_lossy(MAGIC),
                String::from_utf8_lossy(&signature)
            )));
        }

        let count = decoder.read_i32::<BigEndian>()?;
        let entry_count = u32::try_from(count)
            .map_err(|_| PatchError::Format(format!("Negative entry count {count}")))?;
        let declared = DistributionSet::from_bitfield_masked(decoder.read_u8()?);

        debug!("Bundle header: {} entries for {}", entry_count, declared);

        Ok(Self {
            decoder: Some(decoder),
            declared,
            entry_count,
            entries_read: 0,
            closed: false,
            cursor_taken: false,
            failed: false,
            pool,
        })
    }

    pub fn declared_distributions(&self) -> DistributionSet {
        self.declared
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn entries_read(&self) -> u32 {
        self.entries_read
    }

    pub fn has_more_entries(&self) -> bool {
        !self.closed && !self.failed && self.entries_read < self.entry_count
    }

    /// Decode the next record, or `None` once every entry was read.
    ///
    /// Any error leaves the stream position undefined, so every later call
    /// fails with a usage error.
    pub fn read_entry(&mut self) -> Result<Option<PatchRecord>> {
        self.check_usable()?;
        if self.entries_read >= self.entry_count {
            return Ok(None);
        }
        let record = self.decode_entry();
        if record.is_err() {
            self.failed = true;
        }
        record.map(Some)
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(PatchError::Usage("Bundle reader is closed".into()));
        }
        if self.failed {
            return Err(PatchError::Usage(format!(
                "Bundle reader failed decoding entry {}",
                self.entries_read
            )));
        }
        Ok(())
    }

    fn decode_entry(&mut self) -> Result<PatchRecord> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| PatchError::Usage("Bundle reader has no stream".into()))?;

        let flags = decoder.read_u8()?;
        let (operation, bits) = decode_flags(flags)?;
        let distributions = DistributionSet::from_bitfield(bits)?;
        if distributions.is_empty() {
            return Err(PatchError::Format(format!(
                "Entry {} has no distributions",
                self.entries_read
            )));
        }
        if !distributions.is_subset_of(self.declared) {
            return Err(PatchError::Format(format!(
                "Entry {} targets {}, bundle declares only {}",
                self.entries_read, distributions, self.declared
            )));
        }

        let path_len = decoder.read_u16::<BigEndian>()? as usize;
        let mut path = vec![0u8; path_len];
        decoder.read_exact(&mut path)?;
        validate_path_bytes(&path)?;
        let target_path = String::from_utf8(path)
            .map_err(|e| PatchError::Format(format!("Path is not ASCII: {e}")))?;

        let base_checksum = match operation {
            Operation::Modify => Some(decoder.read_i32::<BigEndian>()? as u32),
            _ => None,
        };

        let data_len = decoder.read_i32::<BigEndian>()?;
        let data_len = u64::try_from(data_len).map_err(|_| {
            PatchError::Format(format!("Negative data length {data_len} for {target_path}"))
        })?;
        if operation == Operation::Remove && data_len != 0 {
            return Err(PatchError::Format(format!(
                "REMOVE entry {target_path} carries {data_len} payload bytes"
            )));
        }

        // Length is untrusted until the bytes arrive; let the buffer grow.
        let mut data = self.pool.take(data_len.min(1 << 20) as usize);
        let read = decoder.by_ref().take(data_len).read_to_end(&mut data)?;
        if read as u64 != data_len {
            return Err(PatchError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("Payload of {target_path} truncated: {read} of {data_len} bytes"),
            )));
        }

        self.entries_read += 1;
        trace!(
            "Read {} {} for {} ({} bytes)",
            operation,
            target_path,
            distributions,
            data.len()
        );

        Ok(PatchRecord {
            operation,
            target_path,
            distributions,
            base_checksum,
            data,
        })
    }

    /// Iterator over the remaining entries. Only available once, and only
    /// before any `read_entry` call.
    pub fn entries(&mut self) -> Result<Entries<'_, R>> {
        self.check_usable()?;
        if self.cursor_taken {
            return Err(PatchError::Usage(
                "Bundle entries can only be iterated once".into(),
            ));
        }
        if self.entries_read > 0 {
            return Err(PatchError::Usage(format!(
                "Cannot iterate after {} entries were read manually",
                self.entries_read
            )));
        }
        self.cursor_taken = true;
        Ok(Entries {
            reader: self,
            done: false,
        })
    }

    /// Return a consumed record's payload buffer to the pool.
    pub fn recycle(&self, record: PatchRecord) {
        self.pool.give(record.data);
    }

    /// Release the stream. A second call does nothing.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.decoder = None;
        }
    }
}

pub struct Entries<'a, R: Read> {
    reader: &'a mut BundleReader<R>,
    done: bool,
}

impl<R: Read> Iterator for Entries<'_, R> {
    type Item = Result<PatchRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.reader.read_entry().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_writer::BundleWriter;
    use crate::distribution::Distribution;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn set(dists: &[Distribution]) -> DistributionSet {
        dists.iter().copied().collect()
    }

    fn compress(raw: &[u8]) -> Vec<u8> {
        zstd::encode_all(raw, 3).unwrap()
    }

    fn header(count: i32, declared: u8) -> Vec<u8> {
        let mut raw = MAGIC.to_vec();
        raw.write_i32::<BigEndian>(count).unwrap();
        raw.push(declared);
        raw
    }

    fn sample_records() -> Vec<PatchRecord> {
        use Distribution::*;
        vec![
            PatchRecord::create("new/file.txt", set(&[Client, Server]), b"content".to_vec()),
            PatchRecord::modify("a/B.class", set(&[Joined]), 0xCAFE_BABE, vec![1, 2, 3]),
            PatchRecord::remove("gone.txt", set(&[Client, Server, Joined])),
            PatchRecord::create("empty.bin", set(&[Server]), Vec::new()),
        ]
    }

    fn write_bundle(records: &[PatchRecord], declared: DistributionSet) -> Vec<u8> {
        let mut writer = BundleWriter::new(Vec::new(), declared).unwrap();
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_round_trip() {
        let records = sample_records();
        let bytes = write_bundle(&records, DistributionSet::all());

        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.entry_count(), records.len() as u32);
        assert_eq!(reader.declared_distributions(), DistributionSet::all());

        let read: Vec<PatchRecord> = reader.entries().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(read, records);
        assert_eq!(reader.entries_read(), records.len() as u32);
        assert!(!reader.has_more_entries());
        assert!(reader.read_entry().unwrap().is_none());
    }

    #[test]
    fn test_empty_bundle() {
        let bytes = write_bundle(&[], set(&[Distribution::Server]));
        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.entry_count(), 0);
        assert!(!reader.has_more_entries());
        assert!(reader.read_entry().unwrap().is_none());
    }

    #[test]
    fn test_bad_signature() {
        let mut raw = header(0, 1);
        raw[0] = b'X';
        let err = BundleReader::new(compress(&raw).as_slice()).err().unwrap();
        assert!(matches!(err, PatchError::Format(_)), "{err}");
    }

    #[test]
    fn test_not_compressed() {
        let err = BundleReader::new(header(0, 1).as_slice()).err().unwrap();
        assert!(matches!(err, PatchError::Format(_) | PatchError::Io(_)), "{err}");
    }

    #[test]
    fn test_negative_entry_count() {
        let err = BundleReader::new(compress(&header(-1, 1)).as_slice())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Negative entry count"), "{err}");
    }

    #[test]
    fn test_header_masks_unknown_bits() {
        let bytes = compress(&header(0, 0b1111_1010));
        let reader = BundleReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.declared_distributions(), set(&[Distribution::Server]));
    }

    fn single_entry(flags: u8, path: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut raw = header(1, 0b011);
        raw.push(flags);
        raw.write_u16::<BigEndian>(path.len() as u16).unwrap();
        raw.extend_from_slice(path);
        raw.write_all(tail).unwrap();
        compress(&raw)
    }

    fn read_single(bytes: &[u8]) -> Result<Option<PatchRecord>> {
        BundleReader::new(bytes)?.read_entry()
    }

    #[test]
    fn test_unknown_operation_tag() {
        let bytes = single_entry(0b0001_1001, b"a", &[0, 0, 0, 0]);
        let err = read_single(&bytes).unwrap_err();
        assert!(err.to_string().contains("Unknown operation tag 3"), "{err}");
    }

    #[test]
    fn test_undeclared_distribution() {
        // joined bit set, header declares client+server
        let bytes = single_entry(0b0000_0100, b"a", &[0, 0, 0, 0]);
        let err = read_single(&bytes).unwrap_err();
        assert!(matches!(err, PatchError::Format(_)), "{err}");
    }

    #[test]
    fn test_empty_entry_distribution() {
        let bytes = single_entry(0b0000_0000, b"a", &[0, 0, 0, 0]);
        assert!(matches!(read_single(&bytes), Err(PatchError::Format(_))));
    }

    #[test]
    fn test_invalid_path_bytes() {
        for path in [&b"a\x00b"[..], b"a/../b", b"", b"x\xffy", b"a//b"] {
            let bytes = single_entry(0b0000_0001, path, &[0, 0, 0, 0]);
            let err = read_single(&bytes).unwrap_err();
            assert!(matches!(err, PatchError::InvalidPath { .. }), "{path:?}: {err}");
        }
    }

    #[test]
    fn test_negative_data_length() {
        let bytes = single_entry(0b0000_0001, b"a", &[0xFF, 0xFF, 0xFF, 0xFF]);
        let err = read_single(&bytes).unwrap_err();
        assert!(err.to_string().contains("Negative data length"), "{err}");
    }

    #[test]
    fn test_remove_with_payload() {
        let bytes = single_entry(0b0001_0001, b"a", &[0, 0, 0, 1, 0x55]);
        let err = read_single(&bytes).unwrap_err();
        assert!(matches!(err, PatchError::Format(_)), "{err}");
    }

    #[test]
    fn test_modify_reads_checksum() {
        let bytes = single_entry(0b0000_1010, b"m", &[0xFF, 0, 0, 0x10, 0, 0, 0, 1, 9]);
        let record = read_single(&bytes).unwrap().unwrap();
        assert_eq!(record.operation, Operation::Modify);
        assert_eq!(record.base_checksum, Some(0xFF00_0010));
        assert_eq!(record.data, vec![9]);
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = single_entry(0b0000_0001, b"a", &[0, 0, 0, 10, 1, 2]);
        let err = read_single(&bytes).unwrap_err();
        match err {
            PatchError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_single_cursor() {
        let bytes = write_bundle(&sample_records(), DistributionSet::all());

        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        reader.read_entry().unwrap().unwrap();
        assert!(matches!(reader.entries(), Err(PatchError::Usage(_))));

        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        {
            let mut entries = reader.entries().unwrap();
            entries.next().unwrap().unwrap();
        }
        assert!(matches!(reader.entries(), Err(PatchError::Usage(_))));
        // Manual reads continue from the shared position.
        assert_eq!(reader.read_entry().unwrap().unwrap().target_path, "a/B.class");
        assert_eq!(reader.entries_read(), 2);
    }

    #[test]
    fn test_read_after_error_fails() {
        let mut raw = header(2, 0b001);
        for (path, content) in [(b"\x01", b'A'), (b"z", b'Z')] {
            raw.push(0b0000_0001);
            raw.write_u16::<BigEndian>(path.len() as u16).unwrap();
            raw.extend_from_slice(path);
            raw.write_i32::<BigEndian>(1).unwrap();
            raw.push(content);
        }
        let bytes = compress(&raw);

        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        let err = reader.read_entry().unwrap_err();
        assert!(matches!(err, PatchError::InvalidPath { .. }), "{err}");
        assert!(!reader.has_more_entries());
        assert!(matches!(reader.read_entry(), Err(PatchError::Usage(_))));
        assert!(matches!(reader.entries(), Err(PatchError::Usage(_))));
        assert_eq!(reader.entries_read(), 0);
    }

    #[test]
    fn test_read_after_close() {
        let bytes = write_bundle(&sample_records(), DistributionSet::all());
        let mut reader = BundleReader::new(bytes.as_slice()).unwrap();
        reader.close();
        reader.close();
        assert!(!reader.has_more_entries());
        assert!(matches!(reader.read_entry(), Err(PatchError::Usage(_))));
        assert!(matches!(reader.entries(), Err(PatchError::Usage(_))));
    }

    #[test]
    fn test_recycle_feeds_pool() {
        let bytes = write_bundle(&sample_records(), DistributionSet::all());
        let pool = Arc::new(BufferPool::new());
        let mut reader = BundleReader::with_pool(bytes.as_slice(), pool.clone()).unwrap();
        let record = reader.read_entry().unwrap().unwrap();
        reader.recycle(record);
        assert_eq!(pool.pooled(), 1);
    }
}
