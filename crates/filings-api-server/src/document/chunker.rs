use anyhow::Result;

/// Split text into overlapping character windows. Each chunk is trimmed of
/// surrounding whitespace; offset anchoring back into the source text is
/// the pipeline's concern, not the chunker's.
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn chunk(&self, text: &str) -> Result<Vec<String>> {
        let chars: Vec<char> = text.chars().collect();
        let total_len = chars.len();

        let mut chunks = Vec::new();
        if total_len == 0 {
            return Ok(chunks);
        }

        let mut start = 0;
        while start < total_len {
            let end = std::cmp::min(start + self.chunk_size, total_len);

            let content: String = chars[start..end].iter().collect();
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }

            if end >= total_len {
                break;
            }

            start += self.chunk_size - self.overlap;
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_produces_no_chunks() {
        let chunker = TextChunker::new(100, 20);
        assert!(chunker.chunk("").unwrap().is_empty());
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunker = TextChunker::new(100, 20);
        let chunks = chunker.chunk("a short filing excerpt").unwrap();
        assert_eq!(chunks, vec!["a short filing excerpt".to_string()]);
    }

    #[test]
    fn test_windows_overlap() {
        let chunker = TextChunker::new(10, 4);
        let chunks = chunker.chunk("abcdefghijklmnopqrstuvwxyz").unwrap();

        // Step is chunk_size - overlap = 6.
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ghijklmnop");
        // Consecutive chunks share their overlap region.
        assert!(chunks[0].ends_with(&chunks[1][..4]));
    }

    #[test]
    fn test_chunks_are_trimmed() {
        let chunker = TextChunker::new(8, 0);
        let chunks = chunker.chunk("  lead  and trail  ").unwrap();
        assert!(chunks.iter().all(|c| c == c.trim()));
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_overlap_larger_than_size_is_clamped() {
        // Would loop forever without the clamp.
        let chunker = TextChunker::new(4, 10);
        let chunks = chunker.chunk("abcdefgh").unwrap();
        assert!(chunks.len() >= 2);
    }
}
