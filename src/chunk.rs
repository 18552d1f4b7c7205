//! Overlapping fixed-size text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of roughly `chunk_size`
//! characters, each overlapping its predecessor by exactly `overlap`
//! characters. Sizes and offsets are counted in Unicode scalar values so
//! CJK text is measured the same way as Latin text.
//!
//! # Algorithm
//!
//! 1. Start a window at `start` spanning `chunk_size` characters.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise look backwards through the last fifth of the window for a
//!    sentence terminator, then for whitespace, and end the chunk just after
//!    it. Without either, hard-split at `chunk_size`.
//! 4. The next window starts at `end - overlap`.
//!
//! Chunk IDs are UUID v5 values over `"{source_path}#{sequence_index}"`, so
//! re-chunking an unchanged document yields identical IDs.
//!
//! # Example
//!
//! ```rust
//! use kylin_assist::chunk::chunk_text;
//!
//! let chunks = chunk_text("/docs/a.txt", "Hello world. Second sentence.", 500, 50).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].sequence_index, 0);
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Chunk;

/// Fraction of the window (1/N) searched for a natural boundary.
const BOUNDARY_WINDOW_DIVISOR: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunking configuration: {0}")]
    InvalidConfiguration(String),
}

/// Split `text` into overlapping chunks.
///
/// # Guarantees
///
/// - Empty or whitespace-only text yields no chunks.
/// - Sequence indices are contiguous: `0, 1, 2, …, N-1`.
/// - The first chunk starts at 0 and the last ends at the text length.
/// - `chunks[i + 1].char_start == chunks[i].char_end - overlap`.
/// - Output depends only on the inputs.
///
/// # Errors
///
/// [`ChunkError::InvalidConfiguration`] if `chunk_size == 0` or
/// `overlap >= chunk_size`.
pub fn chunk_text(
    source_path: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidConfiguration(
            "chunk_size must be > 0".to_string(),
        ));
    }
    if overlap >= chunk_size {
        return Err(ChunkError::InvalidConfiguration(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + chunk_size).min(len);
        let end = if hard_end < len {
            find_boundary(&chars, start, hard_end, chunk_size, overlap)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        let index = chunks.len();
        chunks.push(make_chunk(source_path, index, start, end, piece));

        if end >= len {
            break;
        }
        // end > start + overlap, so this always advances
        start = end - overlap;
    }

    Ok(chunks)
}

fn find_boundary(
    chars: &[char],
    start: usize,
    hard_end: usize,
    chunk_size: usize,
    overlap: usize,
) -> usize {
    let min_len = (chunk_size - chunk_size / BOUNDARY_WINDOW_DIVISOR).max(overlap + 1);
    let floor = start + min_len;
    if floor >= hard_end {
        return hard_end;
    }

    if let Some(end) = (floor..=hard_end)
        .rev()
        .find(|&e| is_sentence_end(chars[e - 1]))
    {
        return end;
    }
    if let Some(end) = (floor..=hard_end)
        .rev()
        .find(|&e| chars[e - 1].is_whitespace())
    {
        return end;
    }
    hard_end
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？' | '；')
}

/// Stable chunk ID for `(source_path, sequence_index)`.
pub fn chunk_id(source_path: &str, sequence_index: usize) -> String {
    let name = format!("{}#{}", source_path, sequence_index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn make_chunk(source_path: &str, index: usize, start: usize, end: usize, text: String) -> Chunk {
    Chunk {
        id: chunk_id(source_path, index),
        hash: sha256_hex(text.as_bytes()),
        text,
        source_path: source_path.to_string(),
        sequence_index: index,
        char_start: start,
        char_end: end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_coverage(text: &str, chunks: &[Chunk], overlap: usize) {
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(chunks.first().unwrap().char_start, 0);
        assert_eq!(chunks.last().unwrap().char_end, chars.len());
        for pair in chunks.windows(2) {
            assert_eq!(
                pair[1].char_start,
                pair[0].char_end - overlap,
                "overlap mismatch between {} and {}",
                pair[0].sequence_index,
                pair[1].sequence_index
            );
        }
        for c in chunks {
            let expected: String = chars[c.char_start..c.char_end].iter().collect();
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 500, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].char_end, 13);
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("doc1", "", 500, 50).unwrap().is_empty());
        assert!(chunk_text("doc1", "  \n\t \n ", 500, 50).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            chunk_text("doc1", "text", 10, 10),
            Err(ChunkError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            chunk_text("doc1", "text", 0, 0),
            Err(ChunkError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_coverage_and_exact_overlap() {
        let text = (0..120)
            .map(|i| format!("Sentence number {} talks about kernels.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc1", &text, 200, 30).unwrap();
        assert!(chunks.len() > 5);
        assert_coverage(&text, &chunks, 30);
        for c in &chunks[..chunks.len() - 1] {
            let len = c.char_end - c.char_start;
            assert!(len <= 200 && len >= 160, "chunk length {} out of range", len);
        }
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = "aaaa aaaa. bbbb bbbb cccc";
        // chunk_size 12 => window floor at 10 chars; '.' ends at 10
        let chunks = chunk_text("doc1", text, 12, 2).unwrap();
        assert_eq!(chunks[0].text, "aaaa aaaa.");
        assert_coverage(text, &chunks, 2);
    }

    #[test]
    fn test_hard_split_without_boundaries() {
        let text = "x".repeat(1000);
        let chunks = chunk_text("doc1", &text, 100, 10).unwrap();
        assert_coverage(&text, &chunks, 10);
        for c in &chunks[..chunks.len() - 1] {
            assert_eq!(c.char_end - c.char_start, 100);
        }
    }

    #[test]
    fn test_multibyte_text_counts_characters() {
        let text = "银河麒麟操作系统是一款国产操作系统。".repeat(40);
        let chunks = chunk_text("doc1", &text, 50, 5).unwrap();
        assert!(chunks.len() > 1);
        assert_coverage(&text, &chunks, 5);
        for c in &chunks {
            assert!(c.text.chars().count() <= 50);
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let text = "word ".repeat(500);
        let chunks = chunk_text("doc1", &text, 37, 7).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_deterministic_ids() {
        let text = "Alpha beta gamma. ".repeat(100);
        let c1 = chunk_text("/docs/a.md", &text, 64, 8).unwrap();
        let c2 = chunk_text("/docs/a.md", &text, 64, 8).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1[0].id, chunk_id("/docs/a.md", 0));

        let other = chunk_text("/docs/b.md", &text, 64, 8).unwrap();
        assert_ne!(c1[0].id, other[0].id);
    }
}
