//! Boundary-aware text chunking.
//!
//! Splits oversize documents into chunks for the map phase, preferring
//! sentence and line boundaries over hard cuts. Chunks may overlap by a
//! configurable number of bytes so entities straddling a cut appear in
//! at least one chunk intact.

use std::ops::Range;

use sha2::{Digest, Sha256};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16_000;

/// Default overlap between consecutive chunks in bytes.
pub const DEFAULT_OVERLAP: usize = 800;

/// A contiguous slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Dense 0-based position of this chunk within the document.
    pub index: usize,
    /// Trimmed chunk content.
    pub text: String,
    /// Byte range of `text` within the source document.
    pub byte_range: Range<usize>,
}

impl Chunk {
    /// Chunk length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the chunk is empty. Never true for emitted chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Stable identifier for a source document.
///
/// Identical input yields an identical fingerprint, which keys the
/// pipeline checkpoint so a restarted run can recognize its document.
#[must_use]
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Splits `text` into chunks of at most `size` bytes with `overlap`
/// bytes shared between consecutive chunks.
///
/// The cut point backs up from the size limit to the last `.` or
/// newline, provided that boundary lies past the midpoint of the chunk;
/// otherwise a hard cut is used. Emitted chunks are trimmed and never
/// empty; `index` is dense and 0-based. Any `overlap >= size` is
/// neutralized by the loop-safety rule rather than rejected.
#[must_use]
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if size == 0 || text.trim().is_empty() {
        return chunks;
    }

    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < len {
        let hard_end = (start + size).min(len);
        let mut end = hard_end;

        if end < len {
            // Prefer the last sentence or line boundary past the midpoint.
            let floor = start + size / 2;
            let mut boundary = None;
            let mut i = end;
            while i > floor && i > start {
                let b = bytes[i - 1];
                if b == b'.' || b == b'\n' {
                    boundary = Some(i);
                    break;
                }
                i -= 1;
            }

            if let Some(b) = boundary {
                end = b;
            } else {
                // Hard cut: back off to a char boundary.
                while end > start && !text.is_char_boundary(end) {
                    end -= 1;
                }
                if end == start {
                    // A single code point wider than `size`; take it whole.
                    end = hard_end;
                    while end < len && !text.is_char_boundary(end) {
                        end += 1;
                    }
                }
            }
        }

        let slice = &text[start..end];
        let trimmed = slice.trim();
        if !trimmed.is_empty() {
            let lead = slice.len() - slice.trim_start().len();
            let t_start = start + lead;
            chunks.push(Chunk {
                index,
                text: trimmed.to_string(),
                byte_range: t_start..t_start + trimmed.len(),
            });
            index += 1;
        }

        if end >= len {
            break;
        }

        let mut next = end.saturating_sub(overlap);
        while next > 0 && !text.is_char_boundary(next) {
            next -= 1;
        }
        // Loop safety: never move backwards or stall.
        if next <= start {
            next = end;
        }
        start = next;
    }

    chunks
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_input() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("   \n\t  ", 100, 10).is_empty());
    }

    #[test]
    fn test_zero_size() {
        assert!(chunk_text("hello", 0, 0).is_empty());
    }

    #[test]
    fn test_single_chunk() {
        let chunks = chunk_text("hello world", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].byte_range, 0..11);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        // The '.' at offset 11 lies past the midpoint (8), so the first
        // chunk ends just after it instead of at the hard cut (16).
        let text = "First phase. Second phase continues here.";
        let chunks = chunk_text(text, 16, 0);
        assert_eq!(chunks[0].text, "First phase.");
    }

    #[test]
    fn test_hard_cut_when_boundary_too_early() {
        // The only '.' is before the midpoint, so a hard cut applies.
        let text = "Ab. cdefghijklmnopqrstuvwxyz0123456789";
        let chunks = chunk_text(text, 20, 0);
        assert_eq!(chunks[0].byte_range.end, 20);
    }

    #[test]
    fn test_overlap_shares_content() {
        let text = "a".repeat(25) + "\n" + &"b".repeat(25);
        let chunks = chunk_text(&text, 30, 10);
        assert!(chunks.len() >= 2);
        // Second chunk starts before the first one ends (raw ranges overlap
        // by up to `overlap` bytes before trimming).
        assert!(chunks[1].byte_range.start < chunks[0].byte_range.end + 10);
    }

    #[test]
    fn test_loop_safety_with_degenerate_overlap() {
        // overlap >= size would stall without the loop-safety rule.
        let text = "abcdefghij".repeat(20);
        let chunks = chunk_text(&text, 10, 10);
        assert!(!chunks.is_empty());
        let mut seen = std::collections::HashSet::new();
        for c in &chunks {
            assert!(seen.insert(c.byte_range.start), "chunker revisited offset");
        }
    }

    #[test]
    fn test_multibyte_safety() {
        let text = "héllo wörld ".repeat(50);
        let chunks = chunk_text(&text, 37, 5);
        for c in &chunks {
            assert_eq!(c.text, text[c.byte_range.clone()].to_string());
        }
    }

    #[test]
    fn test_three_chunks_for_large_document() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(778);
        assert!(text.len() > 34_000 && text.len() < 36_000);
        let chunks = chunk_text(&text, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP);
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = fingerprint("same input");
        let b = fingerprint("same input");
        let c = fingerprint("different input");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    proptest! {
        #[test]
        fn prop_chunks_are_source_slices(
            text in "[ a-zA-Z0-9.\n]{0,2000}",
            size in 1usize..400,
            overlap in 0usize..100,
        ) {
            let chunks = chunk_text(&text, size, overlap);
            for c in &chunks {
                prop_assert_eq!(&text[c.byte_range.clone()], c.text.as_str());
                prop_assert!(c.len() <= size + overlap);
                prop_assert!(!c.text.trim().is_empty());
            }
        }

        #[test]
        fn prop_non_whitespace_bytes_covered(
            text in "[ a-z.\n]{0,1500}",
            size in 2usize..200,
        ) {
            let overlap = size / 4;
            let chunks = chunk_text(&text, size, overlap);
            for (pos, b) in text.bytes().enumerate() {
                if !b.is_ascii_whitespace() {
                    prop_assert!(
                        chunks.iter().any(|c| c.byte_range.contains(&pos)),
                        "byte {} not covered", pos
                    );
                }
            }
        }

        #[test]
        fn prop_indexes_dense(
            text in "[ a-z.\n]{0,1500}",
            size in 2usize..200,
        ) {
            let chunks = chunk_text(&text, size, size / 5);
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index, i);
            }
        }
    }
}
