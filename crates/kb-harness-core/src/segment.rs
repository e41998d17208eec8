//! Markdown segmentation into overlapping passages.
//!
//! A knowledge-base file is first split into heading-delimited
//! [`Section`]s, then each section body is cut into chunks by a recursive
//! character splitter ([`TextSplitter`]).
//!
//! # Algorithm
//!
//! 1. A line starting with `## ` opens a new section whose label is the
//!    rest of that line. Text before the first heading is the
//!    `"introduction"` section and is dropped when blank.
//! 2. Each section body is split on the highest-priority separator it
//!    contains (`"\n## "`, `"\n### "`, `"\n\n"`, `"\n"`, `" "`), keeping the
//!    separator at the start of the following piece.
//! 3. Pieces shorter than `chunk_size` are merged greedily into chunks.
//!    When a chunk is emitted, pieces are dropped from its front until at
//!    most `chunk_overlap` characters remain; those carry into the next one.
//! 4. Pieces that are too long are split again with the next separator.
//!    With no separator left, the text is cut per character.
//!
//! Lengths are counted in `char`s, never bytes.
//!
//! # Example
//!
//! ```rust
//! use kb_harness_core::segment::Segmenter;
//!
//! let passages = Segmenter::default().segment("## What is shipping time?\nTwo days.", "faq.md");
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].content, "Two days.");
//! assert_eq!(passages[0].metadata.section, "What is shipping time?");
//! ```

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::models::{Passage, PassageKind, PassageMetadata, INTRODUCTION_SECTION};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators in descending priority. The trailing `""` means "cut anywhere".
pub const DEFAULT_SEPARATORS: [&str; 6] = ["\n## ", "\n### ", "\n\n", "\n", " ", ""];

/// A heading-delimited slice of a markdown file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub label: String,
    pub body: String,
}

/// Split markdown into sections at level-2 headings.
///
/// Returns `k + 1` sections for `k` headings, or `k` when the text before
/// the first heading is blank. Sections with an empty body are still
/// returned; they simply produce no chunks.
pub fn split_sections(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut label: Option<&str> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in content.lines() {
        if let Some(title) = heading_title(line) {
            push_section(&mut sections, label, &body);
            label = Some(title);
            body.clear();
        } else {
            body.push(line);
        }
    }
    push_section(&mut sections, label, &body);

    sections
}

fn push_section(sections: &mut Vec<Section>, label: Option<&str>, body: &[&str]) {
    let body = body.join("\n");
    match label {
        Some(title) => sections.push(Section {
            label: title.to_string(),
            body,
        }),
        None if !body.trim().is_empty() => sections.push(Section {
            label: INTRODUCTION_SECTION.to_string(),
            body,
        }),
        None => {}
    }
}

/// `Some(title)` if `line` is a level-2 heading (`## Title`).
fn heading_title(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("##")?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Recursive character splitter with overlap.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TextSplitter {
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] unless `0 <= chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            ..Self::default()
        })
    }

    /// Replace the separator list. A final `""` is appended if missing so
    /// the splitter can always make progress.
    pub fn with_separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators.into_iter().map(Into::into).collect();
        if self.separators.last().map(|s| !s.is_empty()).unwrap_or(true) {
            self.separators.push(String::new());
        }
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into trimmed, non-empty chunks of at most `chunk_size`
    /// characters.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let found = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s.as_str()));
        let (separator, remaining) = match found {
            Some(i) => (separators[i].as_str(), &separators[i + 1..]),
            None => ("", &separators[separators.len()..]),
        };

        let mut chunks = Vec::new();
        let mut good: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge_pieces(&good));
                good.clear();
            }
            if remaining.is_empty() {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    chunks.push(trimmed.to_string());
                }
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !good.is_empty() {
            chunks.extend(self.merge_pieces(&good));
        }

        chunks
    }

    fn merge_pieces(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                if let Some(chunk) = join_window(&window) {
                    chunks.push(chunk);
                }
                while total > self.chunk_overlap || (total > 0 && total + len > self.chunk_size) {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }

        if let Some(chunk) = join_window(&window) {
            chunks.push(chunk);
        }

        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn join_window(window: &VecDeque<(&str, usize)>) -> Option<String> {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split before every occurrence of `separator`, so each piece after the
/// first starts with it. An empty separator splits into single chars.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// File name without directories or extension: `docs/faq.md` → `faq`.
pub fn doc_type_for(identifier: &str) -> String {
    let name = identifier
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(identifier);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Turns one markdown file into passages.
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    splitter: TextSplitter,
}

impl Segmenter {
    pub fn new(splitter: TextSplitter) -> Self {
        Self { splitter }
    }

    pub fn splitter(&self) -> &TextSplitter {
        &self.splitter
    }

    /// Segment `content` read from `identifier`.
    ///
    /// Output is a pure function of the inputs: segmenting the same file
    /// twice yields identical passages, ids included.
    pub fn segment(&self, content: &str, identifier: &str) -> Vec<Passage> {
        let doc_type = doc_type_for(identifier);
        let kind = PassageKind::for_doc_type(&doc_type);
        let mut passages = Vec::new();

        for section in split_sections(content) {
            for chunk in self.splitter.split_text(&section.body) {
                let metadata = PassageMetadata {
                    source: identifier.to_string(),
                    doc_type: doc_type.clone(),
                    section: section.label.clone(),
                    kind: kind.clone(),
                };
                let ordinal = passages.len();
                passages.push(Passage::new(&chunk, metadata, ordinal));
            }
        }

        passages
    }
}
