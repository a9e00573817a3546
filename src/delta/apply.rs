use super::DiffChunk;
use crate::error::{PatchError, Result};

/// Rebuild the target from `base` and a chunk list.
///
/// Copy ranges are bounds-checked against `base`; a delta built for other
/// base bytes fails here instead of panicking.
pub fn apply_chunks(base: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>> {
    let estimated_size: u64 = chunks
        .iter()
        .map(|c| match c {
            DiffChunk::Copy { length, .. } => *length,
            DiffChunk::Insert { data } => data.len() as u64,
        })
        .fold(0u64, u64::saturating_add);

    let mut result = Vec::with_capacity(estimated_size.min(base.len() as u64 * 4 + 4096) as usize);

    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let range = usize::try_from(*offset)
                    .ok()
                    .zip(usize::try_from(*length).ok())
                    .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                    .filter(|r| r.end <= base.len())
                    .ok_or_else(|| {
                        PatchError::Delta(format!(
                            "Copy of {length} bytes at offset {offset} exceeds base of {} bytes",
                            base.len()
                        ))
                    })?;
                result.extend_from_slice(&base[range]);
            }
            DiffChunk::Insert { data } => {
                result.extend_from_slice(data);
            }
        }
    }

    Ok(result)
}
