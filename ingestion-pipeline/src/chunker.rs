//! C6: text → ordered chunks with bounded size and overlap (§4.6).

use common::error::AppError;
use text_splitter::{ChunkConfig, TextSplitter};

/// Character-bounded chunking parameters (`chunk.size` / `chunk.overlap`).
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Split normalized text into ordered chunks. Built on `text-splitter`'s
/// recursive `TextSplitter`, which tries paragraph break, then newline, then
/// space, then character boundaries in that order, matching §4.6's policy.
/// Whitespace-only input yields an empty list; whitespace-only chunks the
/// splitter might otherwise emit are dropped.
pub fn chunk_text(text: &str, config: ChunkerConfig) -> Result<Vec<String>, AppError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunk_config = ChunkConfig::new(config.chunk_size)
        .with_overlap(config.chunk_overlap)
        .map_err(|e| AppError::Validation(format!("invalid chunker config: {e}")))?;
    let splitter = TextSplitter::new(chunk_config);

    Ok(splitter
        .chunks(text)
        .map(str::to_string)
        .filter(|c| !c.trim().is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    #[test]
    fn empty_input_yields_empty_list() {
        assert!(chunk_text("", cfg(16, 4)).unwrap().is_empty());
        assert!(chunk_text("   \n\n  ", cfg(16, 4)).unwrap().is_empty());
    }

    #[test]
    fn short_input_yields_single_chunk_equal_to_input() {
        let text = "alpha\n\nbeta\n\ngamma";
        let chunks = chunk_text(text, cfg(32, 4)).unwrap();
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn every_chunk_respects_the_size_bound() {
        let text = "one two three four five six seven eight nine ten eleven twelve thirteen fourteen fifteen sixteen seventeen eighteen nineteen twenty";
        let chunks = chunk_text(text, cfg(20, 5)).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20, "chunk exceeds bound: {chunk:?}");
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "paragraph one is here.\n\nparagraph two follows, with more words in it.\n\nand a third.";
        let a = chunk_text(text, cfg(24, 6)).unwrap();
        let b = chunk_text(text, cfg(24, 6)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn no_chunk_is_whitespace_only() {
        let text = "alpha\n\n   \n\nbeta";
        let chunks = chunk_text(text, cfg(6, 0)).unwrap();
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
    }
}
