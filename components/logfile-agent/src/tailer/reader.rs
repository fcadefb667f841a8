//! Line framing over raw reads.
//!
//! [`LineReader`] owns the bytes between the file and the line queue:
//! fed chunks accumulate in a pending buffer, complete lines come out
//! framed on `\n` (or `\n\0` in UTF-16 mode) with the terminator and a
//! preceding `\r` trimmed. An over-long line is split at the size
//! boundary; the continuation bytes stay buffered, nothing is lost.

// Local crates
use crate::tailer::models::Line;

// External crates
use bytes::Bytes;
use chrono::Utc;

/// First read-chunk size; also the threshold past which the chunk
/// upgrades to `max_line_size`.
pub const INITIAL_CHUNK_SIZE: usize = 256 * 1024;

/// Hard per-line cap in UTF-16 mode, independent of buffer size.
pub const UTF16_MAX_LINE: usize = 256 * 1024;

#[derive(Debug)]
pub struct LineReader {
    pending: Vec<u8>,
    /// File offset just past the last byte fed in.
    pos: u64,
    /// Bytes of `pending` already scanned for a delimiter.
    scanned: usize,
    max_line: usize,
    chunk: usize,
    upgraded: bool,
    utf16: bool,
    bom_checked: bool,
}

impl LineReader {
    pub fn new(max_line: usize, utf16: bool) -> Self {
        Self {
            pending: Vec::new(),
            pos: 0,
            scanned: 0,
            max_line,
            chunk: INITIAL_CHUNK_SIZE,
            upgraded: false,
            utf16,
            bom_checked: false,
        }
    }

    /// Size the next raw read should use.
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    pub fn upgraded(&self) -> bool {
        self.upgraded
    }

    /// Raw read position: where the next byte fed in belongs. This is
    /// the seek target after a gate-driven close/reopen.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Reposition after an open or seek; discards any partial line.
    pub fn seek(&mut self, pos: u64) {
        self.pending.clear();
        self.scanned = 0;
        self.pos = pos;
        self.bom_checked = pos > 0;
    }

    /// Truncation restart: back to offset zero with an empty buffer.
    /// The chunk upgrade persists.
    pub fn reset_for_truncation(&mut self) {
        self.seek(0);
    }

    /// Feed one raw chunk; returns every line it completed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Line> {
        let mut data = data;
        self.pos += data.len() as u64;

        if self.utf16 && !self.bom_checked {
            if data.len() >= 2 && (data[..2] == [0xFF, 0xFE] || data[..2] == [0xFE, 0xFF]) {
                data = &data[2..];
            }
            self.bom_checked = true;
        }

        self.pending.extend_from_slice(data);
        self.extract()
    }

    /// Emit whatever partial line remains (EOF drain, deletion drain).
    pub fn drain(&mut self) -> Option<Line> {
        if self.pending.is_empty() {
            return None;
        }
        let text = Bytes::from(std::mem::take(&mut self.pending));
        self.scanned = 0;
        Some(Line {
            text,
            time: Utc::now(),
            end_offset: self.pos,
        })
    }

    fn extract(&mut self) -> Vec<Line> {
        let mut lines = Vec::new();
        loop {
            match (self.find_delimiter(), self.split_cap()) {
                // A terminated line longer than the cap still splits.
                (Some(idx), Some(cap)) if idx > cap => lines.push(self.take_split(cap)),
                (Some(idx), _) => lines.push(self.take_line(idx)),
                (None, Some(cap)) if self.pending.len() >= cap => {
                    lines.push(self.take_split(cap));
                }
                (None, _) => break,
            }
        }
        lines
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        if self.utf16 {
            // `\n\0` aligned to a code-unit boundary.
            let start = self.scanned & !1;
            let mut i = start;
            while i + 1 < self.pending.len() {
                if self.pending[i] == b'\n' && self.pending[i + 1] == 0 {
                    return Some(i);
                }
                i += 2;
            }
            self.scanned = self.pending.len();
            None
        } else {
            let found = self.pending[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|rel| self.scanned + rel);
            if found.is_none() {
                self.scanned = self.pending.len();
            }
            found
        }
    }

    /// Complete line ending at the delimiter starting at `idx`.
    fn take_line(&mut self, idx: usize) -> Line {
        let delim_len = if self.utf16 { 2 } else { 1 };
        let mut consumed: Vec<u8> = self.pending.drain(..idx + delim_len).collect();
        self.scanned = 0;

        // Trim the terminator and an optional preceding carriage return.
        consumed.truncate(idx);
        if self.utf16 {
            if consumed.ends_with(&[b'\r', 0]) {
                consumed.truncate(consumed.len() - 2);
            }
        } else if consumed.ends_with(b"\r") {
            consumed.truncate(consumed.len() - 1);
        }

        self.maybe_upgrade(idx + delim_len);

        Line {
            text: Bytes::from(consumed),
            time: Utc::now(),
            end_offset: self.pos - self.pending.len() as u64,
        }
    }

    /// Length past which a line must be split, when a cap applies.
    fn split_cap(&self) -> Option<usize> {
        if self.utf16 {
            Some(UTF16_MAX_LINE)
        } else if self.max_line > 0 {
            Some(self.max_line)
        } else {
            None
        }
    }

    fn take_split(&mut self, len: usize) -> Line {
        let piece: Vec<u8> = self.pending.drain(..len).collect();
        self.scanned = 0;
        self.maybe_upgrade(len);

        Line {
            text: Bytes::from(piece),
            time: Utc::now(),
            end_offset: self.pos - self.pending.len() as u64,
        }
    }

    /// The first line longer than the initial chunk upgrades the read
    /// chunk to `max_line_size`, once, for the life of the reader.
    fn maybe_upgrade(&mut self, line_len: usize) {
        if !self.upgraded && self.max_line > INITIAL_CHUNK_SIZE && line_len > INITIAL_CHUNK_SIZE {
            self.chunk = self.max_line;
            self.upgraded = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[Line]) -> Vec<Vec<u8>> {
        lines.iter().map(|l| l.text.to_vec()).collect()
    }

    #[test]
    fn frames_lines_with_offsets() {
        let mut r = LineReader::new(0, false);
        let lines = r.feed(b"a\nb\nc\n");
        assert_eq!(texts(&lines), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(
            lines.iter().map(|l| l.end_offset).collect::<Vec<_>>(),
            vec![2, 4, 6]
        );
    }

    #[test]
    fn trims_carriage_return() {
        let mut r = LineReader::new(0, false);
        let lines = r.feed(b"win\r\nnix\n");
        assert_eq!(texts(&lines), vec![b"win".to_vec(), b"nix".to_vec()]);
        // The \r still counts toward the offset.
        assert_eq!(lines[0].end_offset, 5);
    }

    #[test]
    fn partial_line_completes_on_next_feed() {
        let mut r = LineReader::new(0, false);
        assert!(r.feed(b"hel").is_empty());
        let lines = r.feed(b"lo\n");
        assert_eq!(texts(&lines), vec![b"hello".to_vec()]);
        assert_eq!(lines[0].end_offset, 6);
    }

    #[test]
    fn long_line_splits_without_losing_bytes() {
        let mut r = LineReader::new(4, false);
        let lines = r.feed(b"abcdefgh\n");
        assert_eq!(
            texts(&lines),
            vec![b"abcd".to_vec(), b"efgh".to_vec()]
        );
        assert_eq!(lines[0].end_offset, 4);
        assert_eq!(lines[1].end_offset, 9);
    }

    #[test]
    fn split_retains_continuation_across_feeds() {
        let mut r = LineReader::new(4, false);
        let first = r.feed(b"abcdef");
        assert_eq!(texts(&first), vec![b"abcd".to_vec()]);
        let rest = r.feed(b"g\n");
        assert_eq!(texts(&rest), vec![b"efg".to_vec()]);
    }

    #[test]
    fn chunk_upgrades_once_and_persists() {
        let max = INITIAL_CHUNK_SIZE * 2;
        let mut r = LineReader::new(max, false);
        assert_eq!(r.chunk_size(), INITIAL_CHUNK_SIZE);

        let mut big = vec![b'x'; INITIAL_CHUNK_SIZE + 10];
        big.push(b'\n');
        let lines = r.feed(&big);
        assert_eq!(lines.len(), 1);
        assert!(r.upgraded());
        assert_eq!(r.chunk_size(), max);

        r.reset_for_truncation();
        assert!(r.upgraded());
        assert_eq!(r.chunk_size(), max);
    }

    #[test]
    fn utf16_frames_on_low_byte_newline() {
        let mut r = LineReader::new(0, true);
        // BOM, then "ab\r\n" in UTF-16LE.
        let lines = r.feed(&[0xFF, 0xFE, b'a', 0, b'b', 0, b'\r', 0, b'\n', 0]);
        assert_eq!(texts(&lines), vec![vec![b'a', 0, b'b', 0]]);
        assert_eq!(lines[0].end_offset, 10);
    }

    #[test]
    fn utf16_newline_high_byte_is_not_a_delimiter() {
        let mut r = LineReader::new(0, true);
        // U+0A61 has 0x0A in its high byte at an odd position; the pair
        // (0x61, 0x0A) must not frame.
        let lines = r.feed(&[0x61, 0x0A, 0x62, 0x00, b'\n', 0x00]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text.to_vec(), vec![0x61, 0x0A, 0x62, 0x00]);
    }

    #[test]
    fn utf16_caps_line_length() {
        let mut r = LineReader::new(0, true);
        let big = vec![b'x'; UTF16_MAX_LINE + 4];
        let lines = r.feed(&big);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text.len(), UTF16_MAX_LINE);
    }

    #[test]
    fn drain_flushes_partial() {
        let mut r = LineReader::new(0, false);
        r.feed(b"tail without newline");
        let line = r.drain().unwrap();
        assert_eq!(line.text.to_vec(), b"tail without newline".to_vec());
        assert_eq!(line.end_offset, 20);
        assert!(r.drain().is_none());
    }

    #[test]
    fn seek_positions_offsets() {
        let mut r = LineReader::new(0, false);
        r.seek(100);
        let lines = r.feed(b"x\n");
        assert_eq!(lines[0].end_offset, 102);
        assert_eq!(r.position(), 102);
    }
}
