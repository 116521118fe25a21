/// Maximum retained length of a single line (256 KiB).
pub(crate) const MAX_LINE_BYTES: usize = 256 * 1024;
const TRUNCATED_MARKER: &str = "...[truncated]";

/// Splits a byte stream into lines.
///
/// Bytes are accumulated across chunks and a line is only produced once its
/// `\n` terminator arrives, so multi-byte UTF-8 sequences split across reads
/// decode correctly. A trailing `\r` is dropped. Bytes beyond `max_line_bytes`
/// are discarded until the terminator and the line is marked as truncated.
#[derive(Debug)]
pub(crate) struct LineSplitter {
    partial: Vec<u8>,
    max_line_bytes: usize,
    truncated: bool,
}

impl LineSplitter {
    pub(crate) fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line_bytes,
            truncated: false,
        }
    }

    pub(crate) fn push_bytes(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            self.append(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.append(rest);
        lines
    }

    /// Flushes an unterminated tail once the stream has reached EOF.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() && !self.truncated {
            return None;
        }
        Some(self.take_line())
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.max_line_bytes.saturating_sub(self.partial.len());
        if bytes.len() > room {
            self.partial.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.partial.extend_from_slice(bytes);
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let mut line = String::from_utf8_lossy(&bytes).into_owned();
        if std::mem::take(&mut self.truncated) {
            line.push_str(TRUNCATED_MARKER);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn complete_lines() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert_eq!(
            splitter.push_bytes(b"line1\nline2\nline3\n"),
            vec!["line1", "line2", "line3"]
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn partial_line_across_chunks() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert!(splitter.push_bytes(b"hello wor").is_empty());
        assert_eq!(splitter.push_bytes(b"ld\n"), vec!["hello world"]);
    }

    #[test]
    fn many_small_chunks() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert!(splitter.push_bytes(b"1").is_empty());
        assert!(splitter.push_bytes(b"2").is_empty());
        assert_eq!(splitter.push_bytes(b"3\n4"), vec!["123"]);
        assert!(splitter.push_bytes(b"5").is_empty());
        assert_eq!(splitter.push_bytes(b"\n"), vec!["45"]);
    }

    #[test]
    fn empty_chunks_and_blank_lines() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert!(splitter.push_bytes(b"").is_empty());
        assert_eq!(splitter.push_bytes(b"\n\nx\n"), vec!["", "", "x"]);
    }

    #[test]
    fn crlf_terminators() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert_eq!(splitter.push_bytes(b"a\r\nb\r"), vec!["a"]);
        assert_eq!(splitter.push_bytes(b"\n"), vec!["b"]);
    }

    #[test]
    fn unterminated_tail_flushed_at_eof() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert_eq!(splitter.push_bytes(b"line1\nline2"), vec!["line1"]);
        assert_eq!(splitter.finish(), Some("line2".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn long_lines_are_truncated_until_terminator() {
        let mut splitter = LineSplitter::new(8);
        assert!(splitter.push_bytes(b"0123456789").is_empty());
        assert!(splitter.push_bytes(b"abcdef").is_empty());
        assert_eq!(
            splitter.push_bytes(b"ghi\nnext\n"),
            vec!["01234567...[truncated]", "next"]
        );
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        let text = "héllo 🚀\n".as_bytes();
        let (head, tail) = text.split_at(2);
        assert!(splitter.push_bytes(head).is_empty());
        assert_eq!(splitter.push_bytes(tail), vec!["héllo 🚀"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
        assert_eq!(splitter.push_bytes(b"ok \xff\n"), vec!["ok \u{FFFD}"]);
    }
}
