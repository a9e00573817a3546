//! Bundle wire constants, patch records and path rules.
//!
//! Layout inside the compressed stream:
//!
//! ```text
//! signature      8 bytes  "BINPATCH"
//! entry_count    i32 BE   >= 0
//! distributions  u8       bit0 client, bit1 server, bit2 joined
//! entries:
//!   flags        u8       bits 3-4 operation, bits 0-2 distributions
//!   path_len     u16 BE
//!   path         path_len bytes in 0x20..=0x7E
//!   checksum     i32 BE   MODIFY only, unsigned bits
//!   data_len     i32 BE   >= 0, 0 for REMOVE
//!   data
//! ```

use std::fmt;

use crate::distribution::DistributionSet;
use crate::error::{PatchError, Result};

pub const MAGIC: &[u8; 8] = b"BINPATCH";

/// File suffix for bundles inside a patch set directory.
pub const BUNDLE_SUFFIX: &str = ".binpatch";

pub const OPERATION_SHIFT: u8 = 3;
pub const DISTRIBUTION_MASK: u8 = 0b111;

/// Lowest and highest byte allowed in a target path.
pub const PATH_BYTE_MIN: u8 = 0x20;
pub const PATH_BYTE_MAX: u8 = 0x7E;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Modify,
    Remove,
}

impl Operation {
    const BY_TAG: [Operation; 3] = [Operation::Create, Operation::Modify, Operation::Remove];

    pub const fn tag(self) -> u8 {
        match self {
            Operation::Create => 0,
            Operation::Modify => 1,
            Operation::Remove => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Self::BY_TAG
            .get(tag as usize)
            .copied()
            .ok_or_else(|| PatchError::Format(format!("Unknown operation tag {tag}")))
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Modify => "MODIFY",
            Operation::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pack an operation and an entry distribution set into a flag byte.
pub fn encode_flags(op: Operation, dists: DistributionSet) -> u8 {
    (op.tag() << OPERATION_SHIFT) | (dists.to_bitfield() & DISTRIBUTION_MASK)
}

/// Split a flag byte into its operation and raw distribution bits.
pub fn decode_flags(flags: u8) -> Result<(Operation, u8)> {
    let op = Operation::from_tag(flags >> OPERATION_SHIFT)?;
    Ok((op, flags & DISTRIBUTION_MASK))
}

/// One CREATE / MODIFY / REMOVE instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub operation: Operation,
    pub target_path: String,
    pub distributions: DistributionSet,
    /// Adler-32 of the expected base, `Some` iff MODIFY.
    pub base_checksum: Option<u32>,
    pub data: Vec<u8>,
}

impl PatchRecord {
    pub fn create(path: impl Into<String>, dists: DistributionSet, content: Vec<u8>) -> Self {
        Self {
            operation: Operation::Create,
            target_path: path.into(),
            distributions: dists,
            base_checksum: None,
            data: content,
        }
    }

    pub fn modify(
        path: impl Into<String>,
        dists: DistributionSet,
        base_checksum: u32,
        delta: Vec<u8>,
    ) -> Self {
        Self {
            operation: Operation::Modify,
            target_path: path.into(),
            distributions: dists,
            base_checksum: Some(base_checksum),
            data: delta,
        }
    }

    pub fn remove(path: impl Into<String>, dists: DistributionSet) -> Self {
        Self {
            operation: Operation::Remove,
            target_path: path.into(),
            distributions: dists,
            base_checksum: None,
            data: Vec::new(),
        }
    }

    /// Whether the path must exist before this record is applied.
    pub fn expects_existing(&self) -> bool {
        !matches!(self.operation, Operation::Create)
    }
}

/// Check a target path: non-empty, `/`-separated, no empty, `.` or `..`
/// segments, printable ASCII only, length fits in a u16.
pub fn validate_path(path: &str) -> Result<()> {
    validate_path_bytes(path.as_bytes())
}

pub(crate) fn validate_path_bytes(bytes: &[u8]) -> Result<()> {
    let shown = || String::from_utf8_lossy(bytes).into_owned();

    if bytes.is_empty() {
        return Err(PatchError::invalid_path("", "path is empty"));
    }
    if bytes.len() > u16::MAX as usize {
        return Err(PatchError::invalid_path(
            shown(),
            format!("path is {} bytes, limit is {}", bytes.len(), u16::MAX),
        ));
    }
    if let Some((idx, byte)) = bytes
        .iter()
        .enumerate()
        .find(|(_, b)| !(PATH_BYTE_MIN..=PATH_BYTE_MAX).contains(*b))
    {
        return Err(PatchError::invalid_path(
            shown(),
            format!("byte {byte:#04x} at offset {idx} is outside printable ASCII"),
        ));
    }
    for segment in bytes.split(|b| *b == b'/') {
        match segment {
            b"" => return Err(PatchError::invalid_path(shown(), "empty path segment")),
            b"." | b".." => {
                return Err(PatchError::invalid_path(
                    shown(),
                    format!("relative segment {:?}", String::from_utf8_lossy(segment)),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;

    #[test]
    fn test_flags_layout() {
        let dists: DistributionSet = [Distribution::Client, Distribution::Joined]
            .into_iter()
            .collect();
        assert_eq!(encode_flags(Operation::Create, dists), 0b0000_0101);
        assert_eq!(encode_flags(Operation::Modify, dists), 0b0000_1101);
        assert_eq!(encode_flags(Operation::Remove, dists), 0b0001_0101);

        assert_eq!(decode_flags(0b0001_0101).unwrap(), (Operation::Remove, 0b101));
        assert!(decode_flags(0b0001_1000).is_err());
        assert!(decode_flags(0b0010_0001).is_err());
    }

    #[test]
    fn test_valid_paths() {
        for path in ["a.txt", "net/minecraft/Foo.class", "dir with space/x", "..a/b.."] {
            validate_path(path).unwrap();
        }
    }

    #[test]
    fn test_invalid_paths() {
        for path in [
            "",
            "/abs",
            "trailing/",
            "double//slash",
            "./a",
            "a/../b",
            "..",
            "tab\tchar",
            "caf\u{e9}",
        ] {
            let err = validate_path(path).unwrap_err();
            assert!(
                matches!(err, PatchError::InvalidPath { .. }),
                "{path:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_offending_byte_reported() {
        let err = validate_path("bad\x7fname").unwrap_err();
        assert!(err.to_string().contains("0x7f"), "{err}");
    }

    #[test]
    fn test_overlong_path() {
        let path = "a".repeat(u16::MAX as usize + 1);
        assert!(validate_path(&path).is_err());
        validate_path(&"a".repeat(u16::MAX as usize)).unwrap();
    }

    #[test]
    fn test_constructors() {
        let dists = DistributionSet::single(Distribution::Server);
        let remove = PatchRecord::remove("x", dists);
        assert!(remove.data.is_empty());
        assert!(remove.expects_existing());
        assert_eq!(PatchRecord::modify("x", dists, 7, vec![1]).base_checksum, Some(7));
        assert!(!PatchRecord::create("x", dists, vec![]).expects_existing());
    }
}
