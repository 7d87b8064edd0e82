// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte buffer that turns process output chunks into lines.

/// Suffix appended to lines cut at the maximum length.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Accumulates raw output and yields complete lines.
///
/// The buffer never holds more than `max_bytes`; when a chunk would exceed
/// it, the oldest bytes are discarded first. A trailing partial line is kept
/// until the next newline or [`LineBuffer::flush`].
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_bytes: usize,
    max_line_length: usize,
    dropped_bytes: u64,
}

impl LineBuffer {
    pub fn new(max_bytes: usize, max_line_length: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_bytes: max_bytes.max(1),
            max_line_length: max_line_length.max(1),
            dropped_bytes: 0,
        }
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        if self.pending.len() > self.max_bytes {
            let excess = self.pending.len() - self.max_bytes;
            self.pending.drain(..excess);
            self.dropped_bytes += excess as u64;
        }

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .filter_map(|raw| self.finish_line(raw))
            .collect()
    }

    /// Take whatever partial line remains.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.finish_line(&rest)
    }

    /// Bytes discarded so far because the buffer was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn finish_line(&self, raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        Some(truncate_line(&line, self.max_line_length))
    }
}

/// Cut `line` to at most `max_chars` characters, marking the cut.
pub fn truncate_line(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &line[..idx], TRUNCATION_MARKER),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_carry_over() {
        let mut buf = LineBuffer::new(1024, 100);
        assert!(buf.push(b"hel").is_empty());
        assert_eq!(buf.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buf.push(b"ld\r\n\nnext"), vec!["world"]);
        assert_eq!(buf.flush().as_deref(), Some("next"));
        assert!(buf.flush().is_none());
    }

    #[test]
    fn test_cap_drops_oldest_bytes() {
        let mut buf = LineBuffer::new(8, 100);
        assert!(buf.push(b"0123456789").is_empty());
        assert_eq!(buf.dropped_bytes(), 2);
        assert_eq!(buf.pending_len(), 8);
        assert_eq!(buf.push(b"\n"), vec!["3456789"]);
    }

    #[test]
    fn test_long_lines_are_truncated() {
        let mut buf = LineBuffer::new(1024, 5);
        let lines = buf.push("abcdefgh\nabc\n".as_bytes());
        assert_eq!(lines[0], format!("abcde{}", TRUNCATION_MARKER));
        assert_eq!(lines[1], "abc");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_line("héllo", 2), format!("hé{}", TRUNCATION_MARKER));
        assert_eq!(truncate_line("hé", 2), "hé");
    }
}
