//! Newline splitting for the delegate's stderr stream, carrying partial
//! trailing fragments across reads.

pub(crate) struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { partial: Vec::new() }
    }

    /// Absorb a chunk and return every complete line it closes. The trailing
    /// fragment after the last newline stays buffered for the next read.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever fragment remains, if any. Used at end-of-stream.
    pub(crate) fn take_remainder(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(rest)
    }
}
