//! Newline framing for the dispatcher's stdout byte stream.

/// Accumulates raw bytes from the stdout pipe and yields complete lines.
///
/// The trailing partial line stays buffered until its newline arrives.
/// Consumed bytes are erased exactly, terminators included, so the buffer
/// never drifts from what the pipe delivered. Decoding to UTF-8 happens per
/// emitted line and is lossy; embedded NUL bytes pass through untouched.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it closes, newline
    /// stripped.
    pub(crate) fn extend(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Flush whatever is buffered once the stream has ended. A final
    /// unterminated line is returned as-is.
    pub(crate) fn take_remaining(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_line() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.extend(b"finished\n"), vec!["finished"]);
        assert_eq!(buffer.take_remaining(), None);
    }

    #[test]
    fn partial_line_is_held_until_newline() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.extend(b"pack").is_empty());
        assert!(buffer.extend(b"age\tavailable").is_empty());
        assert_eq!(buffer.extend(b"\n"), vec!["package\tavailable"]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut buffer = LineBuffer::new();
        assert_eq!(
            buffer.extend(b"one\ntwo\nthree\ntail"),
            vec!["one", "two", "three"]
        );
        assert_eq!(buffer.take_remaining().as_deref(), Some("tail"));
    }

    #[test]
    fn empty_lines_are_emitted() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.extend(b"\n\na\n"), vec!["", "", "a"]);
    }

    #[test]
    fn exact_byte_erasure_across_chunks() {
        let mut buffer = LineBuffer::new();
        let mut emitted = Vec::new();
        // feed one byte at a time, the worst case for drift
        for &b in b"alpha\nbeta\ngamma" {
            emitted.extend(buffer.extend(&[b]));
        }
        assert_eq!(emitted, vec!["alpha", "beta"]);
        assert_eq!(buffer.take_remaining().as_deref(), Some("gamma"));
        assert_eq!(buffer.take_remaining(), None);
    }

    #[test]
    fn embedded_nul_passes_through() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.extend(b"a\0b\n");
        assert_eq!(lines, vec!["a\0b"]);
    }

    #[test]
    fn carriage_returns_are_not_special() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.extend(b"progress\r\n"), vec!["progress\r"]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.extend(b"ok \xff\xfe end\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" end"));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[test]
    fn take_remaining_on_empty_buffer() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.take_remaining(), None);
    }
}
