//! Multi-distribution binary patch bundles.
//!
//! A bundle is a zstd-compressed list of CREATE / MODIFY / REMOVE records,
//! each tagged with the distributions (client, server, joined) it applies
//! to. [`generator::Generator`] builds bundles from clean/dirty archive
//! pairs, [`patcher::Patcher`] replays them against a base archive, and
//! MODIFY records only apply to the exact base bytes they were made from.

pub mod archive;
pub mod bundle_reader;
pub mod bundle_writer;
pub mod checksum;
pub mod delta;
pub mod distribution;
pub mod error;
pub mod generator;
pub mod patch_format;
pub mod patcher;
pub mod pool;
pub mod transform;

pub use archive::{Archive, ArchiveEntry};
pub use bundle_reader::BundleReader;
pub use bundle_writer::BundleWriter;
pub use distribution::{Distribution, DistributionSet};
pub use error::{PatchError, Result};
pub use generator::{diff_entry, DiffOptions, DiffSummary, Generator};
pub use patch_format::{Operation, PatchRecord};
pub use patcher::{ApplySummary, Patcher};
