pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Byte offsets of line starts in a source text.
pub struct SourceMeta {
    line_starts: Vec<usize>,
    len: usize,
}

impl SourceMeta {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            line_starts,
            len: text.len(),
        }
    }

    pub fn byte_index_to_position(&self, index: usize) -> anyhow::Result<Position> {
        anyhow::ensure!(index <= self.len, "Source index out of range: {index}");

        // The first line always starts at 0.
        let line = self.line_starts.partition_point(|&start| start <= index) - 1;
        let line_start = self.line_starts[line];
        let line_end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.len);

        Ok(Position {
            line,
            character: index - line_start,
            line_start,
            line_end,
        })
    }
}

/// Zero-based location of a byte in the source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    /// Byte offset within the line.
    pub character: usize,
    pub line_start: usize,
    pub line_end: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions() -> anyhow::Result<()> {
        let meta = SourceMeta::new("lda #1\n\nnmi:\n");

        assert_eq!(
            meta.byte_index_to_position(0)?,
            Position {
                line: 0,
                character: 0,
                line_start: 0,
                line_end: 7,
            }
        );
        assert_eq!(meta.byte_index_to_position(5)?.character, 5);
        assert_eq!(meta.byte_index_to_position(7)?.line, 1);
        assert_eq!(
            meta.byte_index_to_position(10)?,
            Position {
                line: 2,
                character: 2,
                line_start: 8,
                line_end: 13,
            }
        );
        assert_eq!(meta.byte_index_to_position(13)?.line, 3);
        assert!(meta.byte_index_to_position(14).is_err());
        Ok(())
    }
}
