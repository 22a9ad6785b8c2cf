//! Page cleanup and recursive-separator chunking.
//!
//! Pages of one source are joined with a blank line and split into
//! [`Chunk`]s of at most `chunk_size` characters, each starting with up to
//! `chunk_overlap` characters copied from the end of its predecessor.
//!
//! # Algorithm
//!
//! 1. Cut the text into units: if a span is larger than `chunk_size`, split
//!    it at the highest-priority separator level present (paragraph break,
//!    line break, sentence end, space), keeping separators attached to the
//!    preceding piece. Pieces that are still too large recurse to the next
//!    level. A span with no separator left is a single oversized unit.
//! 2. Pack units greedily into chunks while the chunk stays within
//!    `chunk_size`.
//! 3. When a chunk is closed, the next one starts at the first word boundary
//!    inside the last `chunk_overlap` characters of the closed chunk. The
//!    overlap shrinks further if the next unit would not fit otherwise.
//!
//! Chunks are exact substrings, so dropping each chunk's `overlap_chars`
//! prefix and concatenating reproduces the joined text.
//!
//! # Example
//!
//! ```rust
//! use manual_assist_core::chunk::{chunk_pages, ChunkParams};
//! use manual_assist_core::models::PageText;
//!
//! let pages = vec![PageText::new(1, "Hello world.")];
//! let chunks = chunk_pages("manual", &pages, &ChunkParams::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].page_number, 1);
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{Chunk, PageText};

/// Separator levels, highest priority first.
const SEPARATOR_LEVELS: &[&[&str]] = &[&["\n\n"], &["\n"], &[". ", "! ", "? "], &[" "]];

/// String inserted between consecutive pages.
pub const PAGE_JOINER: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkParamsError {
    #[error("chunk_size must be greater than zero")]
    ZeroSize,
    #[error("chunk_overlap ({overlap}) must be smaller than chunk_size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

impl ChunkParams {
    pub fn validate(&self) -> Result<(), ChunkParamsError> {
        if self.chunk_size == 0 {
            return Err(ChunkParamsError::ZeroSize);
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ChunkParamsError::OverlapTooLarge {
                size: self.chunk_size,
                overlap: self.chunk_overlap,
            });
        }
        Ok(())
    }
}

/// Normalize OCR/extraction artefacts on one page.
///
/// Collapses runs of spaces and tabs, re-joins words hyphenated across a
/// line break, limits blank-line runs to one, and trims the result.
pub fn clean_page_text(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static HYPHEN_BREAK: OnceLock<Regex> = OnceLock::new();
    static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();

    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"));
    let hyphen = HYPHEN_BREAK.get_or_init(|| Regex::new(r"(\w)-\n(\w)").expect("valid regex"));
    let blanks = BLANK_RUNS.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let text = text.replace("\r\n", "\n");
    let text = spaces.replace_all(&text, " ");
    let text = hyphen.replace_all(&text, "$1$2");
    let text = blanks.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Chunk the pages of one source.
///
/// Pages are joined in the order given. Empty input yields an empty result.
pub fn chunk_pages(
    source_id: &str,
    pages: &[PageText],
    params: &ChunkParams,
) -> Result<Vec<Chunk>, ChunkParamsError> {
    params.validate()?;

    let mut chars: Vec<char> = Vec::new();
    let mut page_starts: Vec<(usize, u32)> = Vec::new();
    for page in pages.iter().filter(|p| !p.text.trim().is_empty()) {
        if !chars.is_empty() {
            chars.extend(PAGE_JOINER.chars());
        }
        page_starts.push((chars.len(), page.page_number));
        chars.extend(page.text.chars());
    }
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let mut units = Vec::new();
    split_units(&chars, 0, chars.len(), 0, params.chunk_size, &mut units);
    let spans = pack_units(&chars, &units, params);

    let chunks = spans
        .into_iter()
        .enumerate()
        .map(|(i, span)| {
            let text: String = chars[span.start..span.end].iter().collect();
            let page_number = page_at(&page_starts, span.start);
            make_chunk(source_id, i as u32, page_number, text, span.overlap)
        })
        .collect();
    Ok(chunks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    overlap: usize,
}

fn split_units(
    chars: &[char],
    start: usize,
    end: usize,
    level: usize,
    size: usize,
    out: &mut Vec<(usize, usize)>,
) {
    if end - start <= size {
        out.push((start, end));
        return;
    }
    let Some(separators) = SEPARATOR_LEVELS.get(level) else {
        out.push((start, end));
        return;
    };

    let pieces = split_at_separators(chars, start, end, separators);
    if pieces.len() == 1 {
        split_units(chars, start, end, level + 1, size, out);
        return;
    }
    for (a, b) in pieces {
        if b - a <= size {
            out.push((a, b));
        } else {
            split_units(chars, a, b, level + 1, size, out);
        }
    }
}

fn split_at_separators(
    chars: &[char],
    start: usize,
    end: usize,
    separators: &[&str],
) -> Vec<(usize, usize)> {
    let seps: Vec<Vec<char>> = separators.iter().map(|s| s.chars().collect()).collect();
    let mut pieces = Vec::new();
    let mut piece_start = start;
    let mut i = start;
    while i < end {
        let matched = seps
            .iter()
            .find(|sep| i + sep.len() <= end && chars[i..i + sep.len()] == sep[..]);
        match matched {
            Some(sep) => {
                let cut = i + sep.len();
                pieces.push((piece_start, cut));
                piece_start = cut;
                i = cut;
            }
            None => i += 1,
        }
    }
    if piece_start < end {
        pieces.push((piece_start, end));
    }
    pieces
}

fn pack_units(chars: &[char], units: &[(usize, usize)], params: &ChunkParams) -> Vec<Span> {
    let size = params.chunk_size;
    let mut spans = Vec::new();
    let mut start = 0;
    let mut fresh_start = 0;
    let mut end = 0;

    for &(_, unit_end) in units {
        if end > fresh_start && unit_end - start > size {
            spans.push(Span {
                start,
                end,
                overlap: fresh_start - start,
            });
            let mut next = overlap_start(chars, start, end, params.chunk_overlap);
            while next < end && unit_end - next > size {
                next = next_word_start(chars, next + 1, end).unwrap_or(end);
            }
            start = next;
            fresh_start = end;
        }
        end = unit_end;
    }
    if end > fresh_start {
        spans.push(Span {
            start,
            end,
            overlap: fresh_start - start,
        });
    }
    spans
}

/// Where the next chunk starts inside the closed chunk `[start, end)`.
fn overlap_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    let lo = end.saturating_sub(overlap).max(start + 1);
    if lo >= end {
        return end;
    }
    next_word_start(chars, lo, end).unwrap_or(lo)
}

fn next_word_start(chars: &[char], from: usize, end: usize) -> Option<usize> {
    (from.max(1)..end).find(|&p| chars[p - 1].is_whitespace() && !chars[p].is_whitespace())
}

fn page_at(page_starts: &[(usize, u32)], offset: usize) -> u32 {
    page_starts
        .iter()
        .take_while(|(start, _)| *start <= offset)
        .last()
        .map(|(_, page)| *page)
        .unwrap_or(1)
}

fn make_chunk(
    source_id: &str,
    index: u32,
    page_number: u32,
    text: String,
    overlap_chars: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    Chunk {
        id: format!("{}#{}", source_id, index),
        source_id: source_id.to_string(),
        page_number,
        chunk_index: index,
        char_length: text.chars().count(),
        text,
        overlap_chars,
        hash,
    }
}

/// Length statistics for a set of chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkStats {
    pub count: usize,
    pub min_chars: usize,
    pub max_chars: usize,
    pub mean_chars: f64,
    pub total_chars: usize,
}

impl ChunkStats {
    /// `None` for an empty slice.
    pub fn from_chunks(chunks: &[Chunk]) -> Option<Self> {
        let min_chars = chunks.iter().map(|c| c.char_length).min()?;
        let max_chars = chunks.iter().map(|c| c.char_length).max()?;
        let total_chars: usize = chunks.iter().map(|c| c.char_length).sum();
        Some(Self {
            count: chunks.len(),
            min_chars,
            max_chars,
            mean_chars: total_chars as f64 / chunks.len() as f64,
            total_chars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams {
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    fn reconstruct(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.fresh_text()).collect()
    }

    fn manual_text() -> String {
        let mut text = String::new();
        for section in 0..6 {
            text.push_str(&format!("Section {} maintenance.\n", section));
            for step in 0..8 {
                text.push_str(&format!(
                    "Step {} requires checking valve {} before restarting the unit. ",
                    step,
                    section * 10 + step
                ));
            }
            text.push_str("\n\n");
        }
        text.trim().to_string()
    }

    #[test]
    fn test_empty_input() {
        let chunks = chunk_pages("m", &[], &ChunkParams::default()).unwrap();
        assert!(chunks.is_empty());
        let pages = vec![PageText::new(1, "   \n  ")];
        assert!(chunk_pages("m", &pages, &ChunkParams::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let pages = vec![PageText::new(1, "The pump must be serviced every 500 hours.")];
        let chunks = chunk_pages("pump", &pages, &ChunkParams::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "pump#0");
        assert_eq!(chunks[0].overlap_chars, 0);
        assert_eq!(chunks[0].char_length, chunks[0].text.chars().count());
    }

    #[test]
    fn test_chunks_respect_size_limit() {
        let pages = vec![PageText::new(1, manual_text())];
        let p = params(200, 40);
        let chunks = chunk_pages("m", &pages, &p).unwrap();
        assert!(chunks.len() > 5);
        for c in &chunks {
            assert!(c.char_length <= 200, "chunk {} too long", c.chunk_index);
            assert!(c.overlap_chars <= 40);
        }
    }

    #[test]
    fn test_reconstruction_is_exact() {
        let text = manual_text();
        let pages = vec![PageText::new(1, text.clone())];
        let chunks = chunk_pages("m", &pages, &params(150, 30)).unwrap();
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_overlap_is_suffix_of_previous_chunk() {
        let pages = vec![PageText::new(1, manual_text())];
        let chunks = chunk_pages("m", &pages, &params(120, 30)).unwrap();
        for pair in chunks.windows(2) {
            let overlap: String = pair[1].text.chars().take(pair[1].overlap_chars).collect();
            assert!(pair[0].text.ends_with(&overlap));
        }
        assert!(chunks.iter().skip(1).any(|c| c.overlap_chars > 0));
    }

    #[test]
    fn test_overlap_starts_on_word_boundary() {
        let pages = vec![PageText::new(1, manual_text())];
        let chunks = chunk_pages("m", &pages, &params(120, 30)).unwrap();
        for c in chunks.iter().skip(1).filter(|c| c.overlap_chars > 0) {
            let first = c.text.chars().next().unwrap();
            assert!(!first.is_whitespace());
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let pages = vec![PageText::new(1, manual_text())];
        let chunks = chunk_pages("m", &pages, &params(100, 20)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index as usize, i);
            assert_eq!(c.id, format!("m#{}", i));
        }
    }

    #[test]
    fn test_unsplittable_token_emitted_whole() {
        let long_token = "X".repeat(50);
        let text = format!("short words here {} and more words after", long_token);
        let pages = vec![PageText::new(1, text.clone())];
        let chunks = chunk_pages("m", &pages, &params(20, 5)).unwrap();
        assert!(chunks.iter().any(|c| c.text.contains(&long_token)));
        for c in chunks.iter().filter(|c| !c.text.contains(&long_token)) {
            assert!(c.char_length <= 20);
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_page_attribution_uses_first_character() {
        let pages = vec![
            PageText::new(1, "Pump overview. ".repeat(10).trim().to_string()),
            PageText::new(2, "Compressor overview. ".repeat(10).trim().to_string()),
        ];
        let chunks = chunk_pages("m", &pages, &params(100, 0)).unwrap();
        assert_eq!(chunks[0].page_number, 1);
        let last = chunks.last().unwrap();
        assert_eq!(last.page_number, 2);
        for c in &chunks {
            if c.text.starts_with("Compressor") {
                assert_eq!(c.page_number, 2);
            }
            if c.text.starts_with("Pump") {
                assert_eq!(c.page_number, 1);
            }
        }
    }

    #[test]
    fn test_empty_pages_are_skipped() {
        let pages = vec![
            PageText::new(1, ""),
            PageText::new(2, "Only page with text."),
        ];
        let chunks = chunk_pages("m", &pages, &ChunkParams::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_number, 2);
    }

    #[test]
    fn test_multibyte_text() {
        let text = "Vérifier la pompe à eau. ".repeat(30);
        let text = text.trim().to_string();
        let pages = vec![PageText::new(1, text.clone())];
        let chunks = chunk_pages("m", &pages, &params(80, 15)).unwrap();
        assert_eq!(reconstruct(&chunks), text);
        for c in &chunks {
            assert!(c.char_length <= 80);
        }
    }

    #[test]
    fn test_deterministic() {
        let pages = vec![PageText::new(1, manual_text())];
        let a = chunk_pages("m", &pages, &params(150, 30)).unwrap();
        let b = chunk_pages("m", &pages, &params(150, 30)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_params() {
        assert_eq!(params(0, 0).validate(), Err(ChunkParamsError::ZeroSize));
        assert!(matches!(
            params(100, 100).validate(),
            Err(ChunkParamsError::OverlapTooLarge { .. })
        ));
        assert!(chunk_pages("m", &[PageText::new(1, "x")], &params(10, 20)).is_err());
    }

    #[test]
    fn test_clean_page_text() {
        let raw = "Replace   the\tfilter  cart-\nridge.\n\n\n\n\nNext  step.  ";
        assert_eq!(clean_page_text(raw), "Replace the filter cartridge.\n\nNext step.");
    }

    #[test]
    fn test_chunk_stats() {
        let pages = vec![PageText::new(1, manual_text())];
        let chunks = chunk_pages("m", &pages, &params(150, 30)).unwrap();
        let stats = ChunkStats::from_chunks(&chunks).unwrap();
        assert_eq!(stats.count, chunks.len());
        assert!(stats.min_chars <= stats.max_chars);
        assert!(stats.max_chars <= 150);
        assert!(ChunkStats::from_chunks(&[]).is_none());
    }
}
