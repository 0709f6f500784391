//! Line-oriented scanner for the agent's block marker.
//!
//! Output arrives in arbitrary chunks, so a marker line may be split across
//! reads. The scanner keeps only the current partial line between calls.

/// The agent asked to stop because it cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockerSignal {
    /// Text after the marker, trimmed.
    pub reason: String,
    /// Bytes of the fed chunk up to and including the marker line.
    pub consumed: usize,
}

#[derive(Debug)]
pub struct BlockSignalScanner {
    marker: String,
    partial: String,
}

impl BlockSignalScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            partial: String::new(),
        }
    }

    /// Feed one chunk. Returns the first complete marker line found in it.
    pub fn feed(&mut self, chunk: &str) -> Option<BlockerSignal> {
        let mut line_start = 0;
        for (idx, byte) in chunk.bytes().enumerate() {
            if byte != b'\n' {
                continue;
            }
            self.partial.push_str(&chunk[line_start..idx]);
            line_start = idx + 1;
            let reason = self.match_line(&self.partial);
            self.partial.clear();
            if let Some(reason) = reason {
                return Some(BlockerSignal {
                    reason,
                    consumed: line_start,
                });
            }
        }
        self.partial.push_str(&chunk[line_start..]);
        None
    }

    /// End of stream: check the unterminated last line.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.partial);
        self.match_line(&line)
    }

    fn match_line(&self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let reason = line.strip_prefix(self.marker.as_str())?.trim();
        if reason.is_empty() {
            return None;
        }
        Some(reason.to_string())
    }
}
