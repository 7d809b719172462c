use std::sync::Arc;

/// Line-indexed view of a UTF-8 document.
///
/// LSP positions count UTF-16 code units; sourcekitd counts UTF-8 bytes. The
/// table is built once per snapshot and answers conversions between the two
/// without rescanning the whole document: the line is found by binary search
/// over precomputed line starts, then only that line is walked.
#[derive(Debug, Clone)]
pub struct LineTable {
    text: Arc<str>,
    /// Byte offset where each line starts. Always non-empty; `starts[0] == 0`.
    starts: Vec<usize>,
}

impl LineTable {
    pub fn new(text: Arc<str>) -> Self {
        let mut starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self { text, starts }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Byte range of a line, including its trailing newline.
    fn line_span(&self, line: usize) -> Option<(usize, usize)> {
        let start = *self.starts.get(line)?;
        let end = self
            .starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.text.len());
        Some((start, end))
    }

    /// Content of a line without its trailing newline.
    fn line_content(&self, line: usize) -> Option<&str> {
        let (start, end) = self.line_span(line)?;
        Some(self.text[start..end].trim_end_matches(['\n', '\r']))
    }

    /// UTF-8 byte offset of `(line, utf16_col)`. `None` if the line does not
    /// exist or the column is past the end of the line.
    pub fn utf8_offset_of(&self, line: u32, utf16_col: u32) -> Option<usize> {
        let (start, _) = self.line_span(line as usize)?;
        let content = self.line_content(line as usize)?;
        let target = utf16_col as usize;

        let mut units = 0usize;
        for (byte, ch) in content.char_indices() {
            let next = units + ch.len_utf16();
            if target < next {
                // An exact hit lands here; a column inside a surrogate pair
                // rounds down to the character it splits.
                return Some(start + byte);
            }
            units = next;
        }
        if target == units {
            Some(start + content.len())
        } else {
            None
        }
    }

    /// `(line, utf16_col)` of a UTF-8 byte offset. Offsets inside a multi-byte
    /// character round down to the character start; `offset == text.len()` is
    /// the end-of-document position.
    pub fn position_of_utf8_offset(&self, offset: usize) -> Option<(u32, u32)> {
        if offset > self.text.len() {
            return None;
        }
        let line = match self.starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let (start, end) = self.line_span(line)?;
        let target = offset.min(end);

        let mut units = 0usize;
        for (byte, ch) in self.text[start..end].char_indices() {
            if target < start + byte + ch.len_utf8() {
                return Some((line as u32, units as u32));
            }
            units += ch.len_utf16();
        }
        Some((line as u32, units as u32))
    }

    /// UTF-16 column of `(line, utf8_col)`. `None` if the line does not exist
    /// or the byte column is past the end of the line.
    pub fn utf16_col_of(&self, line: u32, utf8_col: usize) -> Option<u32> {
        let content = self.line_content(line as usize)?;
        if utf8_col > content.len() {
            return None;
        }
        let mut units = 0usize;
        for (byte, ch) in content.char_indices() {
            if utf8_col < byte + ch.len_utf8() {
                return Some(units as u32);
            }
            units += ch.len_utf16();
        }
        Some(units as u32)
    }
}
