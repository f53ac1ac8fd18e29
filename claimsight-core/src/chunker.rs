//! Document chunking with page estimation.
//!
//! Text is cut into character windows of at most `chunk_size` characters.
//! Each window ends at the best available boundary (paragraph, then
//! sentence, then word, then a raw cut) and the next window starts exactly
//! `chunk_overlap` characters before that end, so consecutive chunks share
//! a fixed amount of context and the original text can be rebuilt from them.

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use serde::{Deserialize, Serialize};

/// A document chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
    pub document_id: Option<String>,
    pub policy_id: Option<String>,
}

impl Chunk {
    /// Storage key for this chunk within its document.
    pub fn storage_id(document_id: &str, chunk_index: usize) -> String {
        format!("{document_id}_chunk_{chunk_index}")
    }
}

/// Boundary kinds, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

impl Boundary {
    const PREFERENCE: [Boundary; 3] = [Boundary::Paragraph, Boundary::Sentence, Boundary::Word];

    /// Whether a cut between `chars[pos - 1]` and `chars[pos]` lands on this boundary.
    fn breaks_at(self, chars: &[char], pos: usize) -> bool {
        let prev = chars[pos - 1];
        match self {
            Boundary::Paragraph => pos >= 2 && prev == '\n' && chars[pos - 2] == '\n',
            Boundary::Sentence => {
                pos >= 2 && prev.is_whitespace() && matches!(chars[pos - 2], '.' | '!' | '?')
            }
            Boundary::Word => prev.is_whitespace() && !chars[pos].is_whitespace(),
        }
    }
}

/// Splits text into overlapping, page-tagged chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::validation("chunk_size must be positive"));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::validation(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Chunk `text` and estimate a page for each chunk.
    ///
    /// Empty text yields no chunks. A `page_count` of 0 is treated as 1.
    pub fn chunk(&self, text: &str, page_count: u32) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let windows = self.windows(&chars);
        let total = windows.len();

        windows
            .into_iter()
            .enumerate()
            .map(|(idx, (start, end))| Chunk {
                text: chars[start..end].iter().collect(),
                chunk_index: idx,
                page_number: Some(estimate_page(idx, total, page_count)),
                document_id: None,
                policy_id: None,
            })
            .collect()
    }

    /// Chunk `text` and stamp every chunk with the owning document and policy.
    pub fn chunk_document(
        &self,
        text: &str,
        page_count: u32,
        document_id: Option<&str>,
        policy_id: Option<&str>,
    ) -> Vec<Chunk> {
        let mut chunks = self.chunk(text, page_count);
        for chunk in &mut chunks {
            chunk.document_id = document_id.map(str::to_string);
            chunk.policy_id = policy_id.map(str::to_string);
        }
        chunks
    }

    /// Character windows `[start, end)` covering `chars`.
    fn windows(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let len = chars.len();
        let mut windows = Vec::new();
        if len == 0 {
            return windows;
        }

        let mut start = 0;
        loop {
            if len - start <= self.chunk_size {
                windows.push((start, len));
                break;
            }
            let end = self.find_cut(chars, start);
            windows.push((start, end));
            start = end - self.chunk_overlap;
        }
        windows
    }

    /// Pick the end of the window starting at `start`. Requires more than
    /// `chunk_size` characters remaining.
    fn find_cut(&self, chars: &[char], start: usize) -> usize {
        let hard_end = start + self.chunk_size;
        // The cut must land past the overlap so the next window advances, and
        // only the back half of the window is searched to avoid tiny chunks.
        let earliest = (start + self.chunk_overlap + 1).max(start + self.chunk_size / 2);

        for boundary in Boundary::PREFERENCE {
            if let Some(pos) = (earliest..=hard_end)
                .rev()
                .find(|&pos| boundary.breaks_at(chars, pos))
            {
                return pos;
            }
        }
        hard_end
    }
}

/// Estimate the 1-based page of chunk `index` assuming chunks are spread
/// evenly over `page_count` pages.
pub fn estimate_page(index: usize, total_chunks: usize, page_count: u32) -> u32 {
    let pages = page_count.max(1) as usize;
    let per_page = (total_chunks / pages).max(1);
    ((index / per_page) + 1).min(pages) as u32
}

/// Rebuild the source text from chunks produced with `overlap`.
pub fn reassemble(chunks: &[Chunk], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(overlap));
        }
    }
    out
}
