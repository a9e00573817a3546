use std::collections::HashMap;

use super::DiffChunk;
use crate::checksum::RollingAdler;

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: usize,
}

/// Compute copy/insert chunks rebuilding `target` from `base`.
///
/// 1. Split base into `block_size` blocks, index them by weak hash
/// 2. Slide a rolling window over target looking for weak hits
/// 3. Confirm hits with BLAKE3 and emit Copy; unmatched bytes become Insert
///
/// Adjacent copies of consecutive base blocks are merged.
pub fn compute_chunks(base: &[u8], target: &[u8], block_size: usize) -> Vec<DiffChunk> {
    if target.is_empty() {
        return Vec::new();
    }
    if base.len() < block_size || target.len() < block_size {
        return vec![DiffChunk::Insert {
            data: target.to_vec(),
        }];
    }

    let signatures = build_signatures(base, block_size);
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }

    let mut out = ChunkSink::default();
    let mut rolling = RollingAdler::new(&target[..block_size]);
    let mut pos = 0;

    while pos + block_size <= target.len() {
        let window = &target[pos..pos + block_size];

        if let Some(offset) = find_match(rolling.digest(), window, &table, &signatures) {
            out.copy(offset as u64, block_size as u64);
            pos += block_size;
            if pos + block_size <= target.len() {
                rolling = RollingAdler::new(&target[pos..pos + block_size]);
            }
        } else {
            out.insert(target[pos]);
            pos += 1;
            if pos + block_size <= target.len() {
                rolling.rotate(target[pos - 1], target[pos + block_size - 1]);
            }
        }
    }

    for &byte in &target[pos..] {
        out.insert(byte);
    }

    out.finish()
}

// Only full-size blocks are indexed; a short tail block can never match a
// full window.
fn build_signatures(base: &[u8], block_size: usize) -> Vec<BlockSignature> {
    base.chunks_exact(block_size)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            weak: RollingAdler::new(block).digest(),
            strong: blake3::hash(block),
            offset: i * block_size,
        })
        .collect()
}

fn find_match(
    weak: u32,
    window: &[u8],
    table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<usize> {
    let candidates = table.get(&weak)?;
    let strong = blake3::hash(window);
    candidates
        .iter()
        .map(|&idx| &signatures[idx])
        .find(|sig| sig.strong == strong)
        .map(|sig| sig.offset)
}

#[derive(Default)]
struct ChunkSink {
    chunks: Vec<DiffChunk>,
    pending: Vec<u8>,
}

impl ChunkSink {
    fn insert(&mut self, byte: u8) {
        self.pending.push(byte);
    }

    fn copy(&mut self, offset: u64, length: u64) {
        self.flush_insert();
        if let Some(DiffChunk::Copy {
            offset: prev_offset,
            length: prev_length,
        }) = self.chunks.last_mut()
        {
            if *prev_offset + *prev_length == offset {
                *prev_length += length;
                return;
            }
        }
        self.chunks.push(DiffChunk::Copy { offset, length });
    }

    fn flush_insert(&mut self) {
        if !self.pending.is_empty() {
            self.chunks.push(DiffChunk::Insert {
                data: std::mem::take(&mut self.pending),
            });
        }
    }

    fn finish(mut self) -> Vec<DiffChunk> {
        self.flush_insert();
        self.chunks
    }
}
