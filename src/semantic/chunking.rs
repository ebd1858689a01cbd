//! Line-based overlapping chunking for long documents.
//!
//! Lines accumulate until the next one would push the buffer past
//! `max_chars`. The buffer is then emitted (if it reaches `min_chars`) and the
//! next buffer is seeded with the trailing lines whose combined length is
//! closest to `overlap_chars`. Only a single line longer than `max_chars` can
//! produce an oversized chunk.

use crate::config::EmbeddingConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl From<&EmbeddingConfig> for ChunkingConfig {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_chars: config.max_chars_per_chunk(),
            overlap_chars: config.overlap_chars(),
            min_chars: config.min_chunk_size,
        }
    }
}

/// A window of consecutive lines. Line numbers are 1-based and inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextChunk {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

struct Line<'a> {
    number: usize,
    text: &'a str,
    chars: usize,
}

#[derive(Default)]
struct Buffer<'a> {
    lines: Vec<Line<'a>>,
    chars: usize,
}

impl<'a> Buffer<'a> {
    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Length after appending `extra` characters on a new line.
    fn len_with(&self, extra: usize) -> usize {
        if self.lines.is_empty() {
            extra
        } else {
            self.chars + 1 + extra
        }
    }

    fn push(&mut self, line: Line<'a>) {
        self.chars = self.len_with(line.chars);
        self.lines.push(line);
    }

    fn pop_front(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let removed = self.lines.remove(0);
        self.chars = if self.lines.is_empty() {
            0
        } else {
            self.chars - removed.chars - 1
        };
    }

    fn to_chunk(&self) -> Option<TextChunk> {
        let first = self.lines.first()?;
        let last = self.lines.last()?;
        let content = self
            .lines
            .iter()
            .map(|line| line.text)
            .collect::<Vec<_>>()
            .join("\n");

        Some(TextChunk {
            content,
            start_line: first.number,
            end_line: last.number,
        })
    }

    /// Trailing lines (never all of them) closest in length to `target`.
    fn overlap_tail(&self, target: usize) -> Buffer<'a> {
        let mut best_count = 0;
        let mut best_distance = target;
        let mut tail_chars = 0;

        for count in 1..self.lines.len() {
            let line = &self.lines[self.lines.len() - count];
            tail_chars = if count == 1 {
                line.chars
            } else {
                tail_chars + 1 + line.chars
            };

            let distance = tail_chars.abs_diff(target);
            if distance < best_distance {
                best_distance = distance;
                best_count = count;
            }
            if tail_chars > target {
                break;
            }
        }

        let mut tail = Buffer::default();
        for line in &self.lines[self.lines.len() - best_count..] {
            tail.push(Line {
                number: line.number,
                text: line.text,
                chars: line.chars,
            });
        }
        tail
    }
}

/// Split `text` into ordered, overlapping chunks.
pub fn chunk_lines(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut buffer = Buffer::default();

    for (index, text) in text.lines().enumerate() {
        let line = Line {
            number: index + 1,
            text,
            chars: text.chars().count(),
        };

        if !buffer.is_empty() && buffer.len_with(line.chars) > config.max_chars {
            if buffer.chars >= config.min_chars {
                chunks.extend(buffer.to_chunk());
            }

            buffer = buffer.overlap_tail(config.overlap_chars);
            while !buffer.is_empty() && buffer.len_with(line.chars) > config.max_chars {
                buffer.pop_front();
            }
        }

        buffer.push(line);
    }

    if buffer.chars >= config.min_chars {
        chunks.extend(buffer.to_chunk());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_chars: usize, overlap_chars: usize, min_chars: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chars,
            overlap_chars,
            min_chars,
        }
    }

    fn numbered_lines(count: usize, width: usize) -> String {
        (1..=count)
            .map(|i| format!("{:0width$}", i, width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_short_document_is_single_chunk() {
        let chunks = chunk_lines("one\ntwo\nthree", &config(100, 10, 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "one\ntwo\nthree");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 3));
    }

    #[test]
    fn test_below_minimum_is_dropped() {
        let chunks = chunk_lines("tiny", &config(100, 10, 50));
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_windows_overlap_by_trailing_lines() {
        // Ten 9-char lines: each chunk holds three (29 chars), overlap seeds one line.
        let text = numbered_lines(10, 9);
        let chunks = chunk_lines(&text, &config(30, 9, 1));

        let ranges: Vec<(usize, usize)> =
            chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 3), (3, 5), (5, 7), (7, 9), (9, 10)]);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 30));
    }

    #[test]
    fn test_overlap_picks_closest_tail() {
        // Lines of 4 chars; a 9-char target matches exactly two trailing lines.
        let text = numbered_lines(8, 4);
        let chunks = chunk_lines(&text, &config(20, 9, 1));

        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 4));
        assert_eq!(chunks[1].start_line, 3);
    }

    #[test]
    fn test_zero_overlap() {
        let text = numbered_lines(6, 9);
        let chunks = chunk_lines(&text, &config(20, 0, 1));
        let ranges: Vec<(usize, usize)> =
            chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 6)]);
    }

    #[test]
    fn test_overlong_line_stands_alone() {
        let text = format!("short\n{}\nshort", "x".repeat(50));
        let chunks = chunk_lines(&text, &config(20, 5, 1));

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].content.len(), 50);
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (2, 2));
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_lines("", &config(20, 5, 0)).is_empty());
    }
}
