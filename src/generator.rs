//! Diff generation: clean/dirty archive pairs in, patch records out.
//!
//! Distributions whose base bytes are identical share one record, so a file
//! that is the same in client, server and joined produces a single MODIFY
//! with one delta.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::archive::Archive;
use crate::bundle_writer::BundleWriter;
use crate::checksum::adler32;
use crate::delta::{BlockDelta, DeltaCodec};
use crate::distribution::{Distribution, DistributionSet};
use crate::error::{PatchError, Result};
use crate::patch_format::{validate_path, Operation, PatchRecord};
use crate::transform::{prepare, ContentTransform};

#[derive(Clone)]
pub struct DiffOptions {
    pub codec: Arc<dyn DeltaCodec>,
    /// Applied to base and modified bytes of matching paths before diffing.
    pub transform: Option<Arc<dyn ContentTransform>>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(BlockDelta::new()),
            transform: None,
        }
    }
}

/// Record counts for a generated bundle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffSummary {
    pub created: usize,
    pub modified: usize,
    pub removed: usize,
}

impl DiffSummary {
    fn count(&mut self, record: &PatchRecord) {
        match record.operation {
            Operation::Create => self.created += 1,
            Operation::Modify => self.modified += 1,
            Operation::Remove => self.removed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.modified + self.removed
    }
}

/// Records turning each distribution's base into `modified`.
///
/// `bases` maps every relevant distribution to its base content, `None` when
/// the distribution lacks the file. `modified == None` means the file is
/// deleted.
pub fn diff_entry(
    path: &str,
    bases: &BTreeMap<Distribution, Option<&[u8]>>,
    modified: Option<&[u8]>,
    options: &DiffOptions,
) -> Result<Vec<PatchRecord>> {
    validate_path(path)?;

    let had: DistributionSet = bases
        .iter()
        .filter(|(_, base)| base.is_some())
        .map(|(dist, _)| *dist)
        .collect();

    let Some(modified) = modified else {
        if had.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![PatchRecord::remove(path, had)]);
    };

    let mut records = Vec::new();
    let transform = options.transform.as_deref();
    // CREATE and MODIFY must both produce the transformed bytes.
    let target = prepare(transform, path, modified)?;

    let missing: DistributionSet = bases
        .iter()
        .filter(|(_, base)| base.is_none())
        .map(|(dist, _)| *dist)
        .collect();
    if !missing.is_empty() {
        records.push(PatchRecord::create(path, missing, target.to_vec()));
    }

    // First-seen order keeps groups sorted by their lowest distribution.
    let mut groups: Vec<(blake3::Hash, DistributionSet, &[u8])> = Vec::new();
    for (dist, base) in bases {
        let Some(base) = *base else { continue };
        let hash = blake3::hash(base);
        match groups.iter_mut().find(|(h, _, _)| *h == hash) {
            Some((_, dists, _)) => dists.insert(*dist),
            None => groups.push((hash, DistributionSet::single(*dist), base)),
        }
    }

    let modified_hash = blake3::hash(modified);
    for (hash, dists, base) in groups {
        if hash == modified_hash {
            continue;
        }
        let base = prepare(transform, path, base)?;
        let delta = options.codec.compute(&base, &target)?;
        let checksum = adler32(&base);
        debug!(
            "{}: delta of {} bytes for {} (base {:08x})",
            path,
            delta.len(),
            dists,
            checksum
        );
        records.push(PatchRecord::modify(path, dists, checksum, delta));
    }

    Ok(records)
}

/// Diffs one clean/dirty archive pair per distribution.
#[derive(Default)]
pub struct Generator {
    sets: BTreeMap<Distribution, (Archive, Archive)>,
    options: DiffOptions,
}

impl Generator {
    pub fn new(options: DiffOptions) -> Self {
        Self {
            sets: BTreeMap::new(),
            options,
        }
    }

    pub fn add_set(&mut self, dist: Distribution, clean: Archive, dirty: Archive) -> Result<()> {
        if self.sets.contains_key(&dist) {
            return Err(PatchError::Usage(format!(
                "Distribution {dist} was already added"
            )));
        }
        debug!(
            "Added {}: {} clean, {} dirty entries",
            dist,
            clean.len(),
            dirty.len()
        );
        self.sets.insert(dist, (clean, dirty));
        Ok(())
    }

    pub fn distributions(&self) -> DistributionSet {
        self.sets.keys().copied().collect()
    }

    /// Records for every path in any registered archive, sorted by path.
    pub fn generate(&self) -> Result<Vec<PatchRecord>> {
        if self.sets.is_empty() {
            return Err(PatchError::Usage("No distributions to diff".into()));
        }

        let paths: BTreeSet<&str> = self
            .sets
            .values()
            .flat_map(|(clean, dirty)| clean.names().chain(dirty.names()))
            .collect();

        let per_path = paths
            .par_iter()
            .map(|path| self.diff_path(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(per_path.into_iter().flatten().collect())
    }

    fn diff_path(&self, path: &str) -> Result<Vec<PatchRecord>> {
        // Distributions sharing the same dirty content are diffed together.
        type Partition<'a> = (
            Option<blake3::Hash>,
            Option<&'a [u8]>,
            BTreeMap<Distribution, Option<&'a [u8]>>,
        );
        let mut partitions: Vec<Partition<'_>> = Vec::new();

        for (dist, (clean, dirty)) in &self.sets {
            let dirty_data = dirty.data(path);
            let key = dirty_data.map(blake3::hash);
            let base = clean.data(path);
            match partitions.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, bases)) => {
                    bases.insert(*dist, base);
                }
                None => partitions.push((key, dirty_data, BTreeMap::from([(*dist, base)]))),
            }
        }

        let mut records = Vec::new();
        for (_, modified, bases) in partitions {
            records.extend(diff_entry(path, &bases, modified, &self.options)?);
        }
        Ok(records)
    }

    /// Generate and write a bundle declaring every registered distribution.
    pub fn write_bundle<W: Write>(&self, out: W) -> Result<(W, DiffSummary)> {
        let records = self.generate()?;
        let mut writer = BundleWriter::new(out, self.distributions())?;
        let mut summary = DiffSummary::default();
        for record in &records {
            writer.write_record(record)?;
            summary.count(record);
        }
        let declared = writer.declared_distributions();
        let out = writer.finish()?;

        info!(
            "Generated {} records for {}: {} created, {} modified, {} removed",
            summary.total(),
            declared,
            summary.created,
            summary.modified,
            summary.removed
        );
        Ok((out, summary))
    }
}
