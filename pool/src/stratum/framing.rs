/// Newline framing for the stratum byte stream
///
/// Reads arrive in arbitrary chunks. Complete lines are handed out in
/// order and a trailing partial line is carried into the next chunk.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self { pending: Vec::new(), max_line_bytes }
    }

    /// Append a chunk and return every line it completes, without the
    /// newline (and without a trailing `\r`). Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, LineTooLong> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            let mut line = std::mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_line_bytes {
                return Err(LineTooLong { limit: self.max_line_bytes });
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        self.pending.extend_from_slice(rest);
        if self.pending.len() > self.max_line_bytes {
            return Err(LineTooLong { limit: self.max_line_bytes });
        }
        Ok(lines)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(b"{\"id\":1").unwrap().is_empty());
        assert_eq!(buf.pending(), 7);
        let lines = buf.push(b"}\n{\"id\":2}\n{\"id\"").unwrap();
        assert_eq!(lines, vec![b"{\"id\":1}".to_vec(), b"{\"id\":2}".to_vec()]);
        assert_eq!(buf.pending(), 5);
        let lines = buf.push(b":3}\r\n").unwrap();
        assert_eq!(lines, vec![b"{\"id\":3}".to_vec()]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buf = LineBuffer::new(1024);
        assert_eq!(buf.push(b"\n\r\na\n").unwrap(), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_overlong_partial_line() {
        let mut buf = LineBuffer::new(4);
        assert_eq!(buf.push(b"abcde"), Err(LineTooLong { limit: 4 }));
        let mut buf = LineBuffer::new(4);
        assert_eq!(buf.push(b"abcdef\n"), Err(LineTooLong { limit: 4 }));
        let mut buf = LineBuffer::new(4);
        assert_eq!(buf.push(b"abcd\n").unwrap(), vec![b"abcd".to_vec()]);
    }
}
