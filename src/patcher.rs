//! Patch application.
//!
//! Bundles are loaded in order and their records for one distribution are
//! replayed against a base archive. Records for the same path are applied
//! in load order, each checked against the output of the previous one;
//! distinct paths are independent and patched in parallel.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{Archive, ArchiveEntry};
use crate::bundle_reader::BundleReader;
use crate::checksum::adler32;
use crate::delta::{BlockDelta, DeltaCodec};
use crate::distribution::Distribution;
use crate::error::{PatchError, Result};
use crate::patch_format::{Operation, PatchRecord, BUNDLE_SUFFIX};
use crate::transform::{prepare, ContentTransform};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    /// Base entries copied through untouched.
    pub files_unpatched: usize,
}

pub struct Patcher {
    distribution: Distribution,
    include_unpatched: bool,
    transform: Option<Arc<dyn ContentTransform>>,
    codec: Arc<dyn DeltaCodec>,
    records: Vec<PatchRecord>,
}

impl Patcher {
    pub fn new(distribution: Distribution) -> Self {
        Self {
            distribution,
            include_unpatched: true,
            transform: None,
            codec: Arc::new(BlockDelta::new()),
            records: Vec::new(),
        }
    }

    /// Whether untouched base entries appear in the output. Defaults to true.
    pub fn include_unpatched(mut self, include: bool) -> Self {
        self.include_unpatched = include;
        self
    }

    /// Must match the transform the bundles were generated with.
    pub fn transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn DeltaCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Records loaded so far that target this patcher's distribution.
    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    /// Queue every record of `reader` that applies to this distribution.
    /// Returns how many were kept. Nothing is queued if any entry fails to
    /// decode.
    pub fn load_bundle<R: Read>(&mut self, reader: BundleReader<R>) -> Result<usize> {
        let records = self.read_bundle(reader)?;
        let kept = records.len();
        self.records.extend(records);
        Ok(kept)
    }

    fn read_bundle<R: Read>(&self, mut reader: BundleReader<R>) -> Result<Vec<PatchRecord>> {
        let mut records = Vec::new();
        while let Some(record) = reader.read_entry()? {
            if record.distributions.contains(self.distribution) {
                records.push(record);
            } else {
                reader.recycle(record);
            }
        }
        debug!(
            "Loaded {} of {} records for {}",
            records.len(),
            reader.entry_count(),
            self.distribution
        );
        reader.close();
        Ok(records)
    }

    /// Load a bundle file, or every `.binpatch` file below a directory whose
    /// relative path starts with `prefix`, in path order.
    pub fn load_patch_set(&mut self, path: &Path, prefix: Option<&str>) -> Result<usize> {
        if !path.is_dir() {
            return self.load_bundle(BundleReader::open(path)?);
        }

        let mut bundles = Vec::new();
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                PatchError::Io(std::io::Error::other(format!(
                    "Failed to scan patch set {}: {e}",
                    path.display()
                )))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry
                .path()
                .strip_prefix(path)
                .ok()
                .and_then(|p| p.to_str())
                .map(|p| p.replace('\\', "/"))
            else {
                continue;
            };
            if name.ends_with(BUNDLE_SUFFIX) && prefix.map_or(true, |p| name.starts_with(p)) {
                bundles.push((name, entry.into_path()));
            }
        }
        bundles.sort();

        if bundles.is_empty() {
            warn!("No {} bundles found in {}", BUNDLE_SUFFIX, path.display());
        }

        let mut records = Vec::new();
        for (name, file) in bundles {
            debug!("Loading bundle {}", name);
            records.extend(self.read_bundle(BundleReader::open(&file)?)?);
        }
        let kept = records.len();
        self.records.extend(records);
        Ok(kept)
    }

    /// Replay the loaded records against `base`. Any failure aborts the
    /// whole operation.
    pub fn apply(&self, base: &Archive) -> Result<(Archive, ApplySummary)> {
        let mut chains: BTreeMap<&str, Vec<&PatchRecord>> = BTreeMap::new();
        for record in &self.records {
            chains
                .entry(record.target_path.as_str())
                .or_default()
                .push(record);
        }

        let patched = chains
            .par_iter()
            .map(|(path, chain)| {
                let before = base.get(path);
                self.apply_chain(path, before.map(|e| e.data.as_slice()), chain)
                    .map(|after| (*path, before.is_some(), after))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut output = Archive::new();
        let mut summary = ApplySummary::default();
        // Every rewritten entry carries the time of this run.
        let stamp = SystemTime::now();

        if self.include_unpatched {
            for entry in base.iter().filter(|e| !chains.contains_key(e.name.as_str())) {
                output.insert(entry.clone());
                summary.files_unpatched += 1;
            }
        }

        for (path, existed, after) in patched {
            match (existed, after) {
                (existed, Some(data)) => {
                    if existed {
                        summary.files_modified += 1;
                    } else {
                        summary.files_added += 1;
                    }
                    output.insert(ArchiveEntry {
                        name: path.to_string(),
                        data,
                        modified: Some(stamp),
                    });
                }
                (true, None) => summary.files_deleted += 1,
                (false, None) => {}
            }
        }

        info!(
            "Patched {}: {} added, {} modified, {} deleted, {} unpatched",
            self.distribution,
            summary.files_added,
            summary.files_modified,
            summary.files_deleted,
            summary.files_unpatched
        );
        Ok((output, summary))
    }

    fn apply_chain(
        &self,
        path: &str,
        base: Option<&[u8]>,
        chain: &[&PatchRecord],
    ) -> Result<Option<Vec<u8>>> {
        let mut current: Option<Cow<'_, [u8]>> = base.map(Cow::Borrowed);

        for record in chain {
            if record.expects_existing() != current.is_some() {
                return Err(PatchError::ContentMismatch {
                    path: path.to_string(),
                    expected_present: record.expects_existing(),
                });
            }

            current = match record.operation {
                Operation::Create => Some(Cow::Owned(record.data.clone())),
                Operation::Remove => None,
                Operation::Modify => {
                    let existing = current.as_deref().unwrap_or_default();
                    let prepared = prepare(self.transform.as_deref(), path, existing)?;
                    let expected = record.base_checksum.ok_or_else(|| {
                        PatchError::Format(format!("MODIFY record for {path} has no checksum"))
                    })?;
                    let actual = adler32(&prepared);
                    if actual != expected {
                        return Err(PatchError::ChecksumMismatch {
                            path: path.to_string(),
                            expected,
                            actual,
                        });
                    }
                    if record.data.is_empty() {
                        None
                    } else {
                        Some(Cow::Owned(self.codec.patch(&prepared, &record.data)?))
                    }
                }
            };
        }

        Ok(current.map(Cow::into_owned))
    }
}
