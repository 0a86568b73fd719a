//! Chunk planning: split a resource of known size into contiguous byte ranges.

use crate::models::Chunk;

/// Partition `size` bytes into `count` near-equal contiguous ranges; the last
/// chunk absorbs the remainder.
///
/// The count is clamped to `size` so no range is empty, and a zero-sized
/// resource yields an empty plan.
pub fn plan_chunks(size: u64, count: usize) -> Vec<Chunk> {
    if size == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(size);
    let base = size / count;

    (0..count)
        .map(|i| {
            let start = i * base;
            let end = if i == count - 1 { size - 1 } else { start + base - 1 };
            Chunk { index: i as usize, start, end }
        })
        .collect()
}

/// Check that `chunks` covers `[0, size)` exactly: indices in order, no gaps,
/// no overlaps.
pub fn validate_plan(chunks: &[Chunk], size: u64) -> Result<(), String> {
    if size == 0 {
        return if chunks.is_empty() {
            Ok(())
        } else {
            Err("empty resource with a non-empty plan".to_string())
        };
    }
    let Some(first) = chunks.first() else {
        return Err("plan has no chunks".to_string());
    };
    if first.start != 0 {
        return Err(format!("first chunk starts at {}", first.start));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i {
            return Err(format!("chunk at position {} has index {}", i, chunk.index));
        }
        if chunk.end < chunk.start {
            return Err(format!("chunk {} ends before it starts", i));
        }
        if let Some(next) = chunks.get(i + 1) {
            if chunk.end + 1 != next.start {
                return Err(format!(
                    "chunk {} ends at {} but chunk {} starts at {}",
                    i,
                    chunk.end,
                    i + 1,
                    next.start
                ));
            }
        }
    }
    let last = chunks[chunks.len() - 1];
    if last.end != size - 1 {
        return Err(format!("last chunk ends at {}, expected {}", last.end, size - 1));
    }
    Ok(())
}
