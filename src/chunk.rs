//! Recursive character text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters, with up to `chunk_overlap` characters repeated between
//! neighbouring chunks. Splitting tries paragraph breaks first, then line
//! breaks, then spaces, and only falls back to single characters for runs
//! with no whitespace.
//!
//! Each chunk carries its byte offset in the source text and a SHA-256 hash
//! of its contents.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Split text into chunks. Returns an empty vector for blank input.
/// Indices are contiguous starting at 0.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(size - 1);

    let pieces = split_recursive(text, SEPARATORS, size, overlap);

    let mut chunks = Vec::new();
    let mut cursor = 0usize;
    for piece in pieces {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        let start = text[cursor..]
            .find(trimmed)
            .map(|pos| cursor + pos)
            .unwrap_or(cursor);
        cursor = next_char_boundary(text, start);
        chunks.push(make_chunk(document_id, chunks.len() as i64, start, trimmed));
    }
    chunks
}

fn split_recursive(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    let position = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let splits: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|s| !s.is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();
    for piece in splits {
        if char_len(piece) <= size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_splits(&fitting, separator, size, overlap));
            fitting.clear();
        }
        if finer.is_empty() {
            out.push(piece.to_string());
        } else {
            out.extend(split_recursive(piece, finer, size, overlap));
        }
    }
    if !fitting.is_empty() {
        out.extend(merge_splits(&fitting, separator, size, overlap));
    }
    out
}

/// Greedily join small splits into chunks, carrying a tail of at most
/// `overlap` characters into the next chunk.
fn merge_splits(splits: &[&str], separator: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut merged = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &split in splits {
        let len = char_len(split);
        let joiner = if window.is_empty() { 0 } else { sep_len };

        if total + joiner + len > size && !window.is_empty() {
            merged.push(join(&window, separator));
            loop {
                let joiner = if window.is_empty() { 0 } else { sep_len };
                let must_shrink = total > overlap || (total > 0 && total + joiner + len > size);
                if !must_shrink {
                    break;
                }
                match window.pop_front() {
                    Some(first) => {
                        total -= char_len(first);
                        if !window.is_empty() {
                            total -= sep_len;
                        }
                    }
                    None => break,
                }
            }
        }

        if !window.is_empty() {
            total += sep_len;
        }
        window.push_back(split);
        total += len;
    }

    if !window.is_empty() {
        merged.push(join(&window, separator));
    }
    merged
}

fn join(window: &VecDeque<&str>, separator: &str) -> String {
    window.iter().copied().collect::<Vec<_>>().join(separator)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn next_char_boundary(text: &str, from: usize) -> usize {
    let mut pos = from + 1;
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos.min(text.len())
}

fn make_chunk(document_id: &str, index: i64, start: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        document_id: document_id.to_string(),
        chunk_index: index,
        start,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", &cfg(500, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].chunk_id(), "doc1#0");
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("doc1", "", &cfg(500, 100)).is_empty());
        assert!(chunk_text("doc1", " \n\n \n", &cfg(500, 100)).is_empty());
    }

    #[test]
    fn test_paragraphs_kept_together_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("doc1", text, &cfg(500, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc1", &text, &cfg(50, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 50, "oversized chunk: {:?}", c.text);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn test_neighbouring_chunks_overlap() {
        let text = (0..60)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc1", &text, &cfg(40, 12));
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let first_word = pair[1].text.split(' ').next().unwrap();
            assert!(
                pair[0].text.contains(first_word),
                "{:?} does not overlap {:?}",
                pair[0].text,
                pair[1].text
            );
        }
    }

    #[test]
    fn test_no_overlap_partitions_words() {
        let words: Vec<String> = (0..40).map(|i| format!("t{}", i)).collect();
        let text = words.join(" ");
        let chunks = chunk_text("doc1", &text, &cfg(30, 0));
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.text.split(' ')).collect();
        assert_eq!(rejoined, words.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    #[test]
    fn test_long_unbroken_run_split_by_chars() {
        let text = "x".repeat(120);
        let chunks = chunk_text("doc1", &text, &cfg(50, 0));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text.len(), 20);
    }

    #[test]
    fn test_offsets_point_into_source() {
        let text = "Alpha beta.\n\nGamma delta epsilon.\n\nZeta eta theta iota.";
        let chunks = chunk_text("doc1", text, &cfg(25, 5));
        for c in &chunks {
            assert_eq!(&text[c.start..c.start + c.text.len()], c.text);
        }
    }

    #[test]
    fn test_multibyte_text() {
        let text = "héllo wörld ünïcode ".repeat(20);
        let chunks = chunk_text("doc1", &text, &cfg(30, 5));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().count() <= 30);
            // Offsets are in bytes, so they slice the source directly.
            assert_eq!(&text[c.start..c.start + c.text.len()], c.text);
        }
        assert!(chunks.iter().any(|c| c.start != text[..c.start].chars().count()));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, &cfg(8, 2));
        let c2 = chunk_text("doc1", text, &cfg(8, 2));
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }
}
