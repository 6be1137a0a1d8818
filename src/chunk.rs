//! Fixed-size overlapping text chunker.
//!
//! Splits a document's extracted text into [`Chunk`]s of `chunk_size`
//! characters that overlap by `chunk_overlap`, so context at a boundary is
//! never lost to the embedding model. Boundaries are computed purely from
//! character counts, never from content, and chunk ids are derived from the
//! document id and chunk index; identical input and parameters always
//! reproduce identical chunks, which is what makes re-indexing idempotent.
//!
//! Offsets are counted in `char`s, not bytes, so multi-byte text can never
//! split a code point.

use crate::config::ChunkingConfig;
use crate::extract::PageSpan;
use crate::models::Chunk;

/// Split extracted document text into overlapping chunks.
///
/// `spans` maps char-offset ranges of `text` back to 1-based page numbers;
/// each produced chunk records the first and last page its range overlaps.
/// Interior windows whose trimmed text falls below `min_chunk_chars` are
/// dropped; the final window is exempt from the floor and kept whenever it
/// holds any non-whitespace text, so a document's tail is always indexed.
/// Returned chunk indices are contiguous from 0.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    spans: &[PageSpan],
    params: &ChunkingConfig,
) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    let size = params.chunk_size;
    let stride = size.saturating_sub(params.chunk_overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + size).min(total);
        windows.push((start, end));
        if end == total {
            break;
        }
        start += stride;
    }

    let last = windows.len() - 1;
    let mut chunks = Vec::new();
    for (i, (start, end)) in windows.into_iter().enumerate() {
        let piece: String = chars[start..end].iter().collect();
        let content = piece.trim().chars().count();
        // The floor applies to interior windows only; the final window
        // carries the document's tail and is dropped only when blank.
        let keep = if i == last {
            content > 0
        } else {
            content >= params.min_chunk_chars
        };
        if !keep {
            continue;
        }
        let index = chunks.len() as u32;
        chunks.push(Chunk {
            id: format!("{}:{}", document_id, index),
            document_id: document_id.to_string(),
            chunk_index: index,
            page_first: page_at(spans, start),
            page_last: page_at(spans, end.saturating_sub(1)),
            text: piece,
            start,
            end,
        });
    }
    chunks
}

/// Page number owning the given char offset. Offsets in the separator gap
/// between two pages attribute to the earlier page.
fn page_at(spans: &[PageSpan], offset: usize) -> u32 {
    if spans.is_empty() {
        return 1;
    }
    let idx = spans.partition_point(|s| s.start <= offset);
    if idx == 0 {
        spans[0].page
    } else {
        spans[idx - 1].page
    }
}
