//! Terminal buffer seam.
//!
//! Real ANSI parsing and scrollback rendering live outside this crate; the
//! multiplexer only needs something it can feed bytes to and ask for a
//! snapshot. [`PlainTextBuffer`] is the built-in implementation: it strips
//! escape sequences and keeps a bounded list of text lines.

use std::collections::VecDeque;

use serde::Serialize;

pub const DEFAULT_SCROLLBACK_LINES: usize = 5_000;

pub trait TerminalBuffer: Send {
    fn ingest(&mut self, chunk: &[u8]);
    fn resize(&mut self, cols: u16, rows: u16);
    fn snapshot(&self) -> TerminalSnapshot;
    fn buffer_tail(&self, lines: usize) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub lines: Vec<String>,
}

#[derive(Debug)]
pub struct PlainTextBuffer {
    cols: u16,
    rows: u16,
    scrollback: usize,
    lines: VecDeque<String>,
    current: String,
    pending: Vec<u8>,
    /// A bare `\r` rewinds the line only once something overwrites it.
    carriage_return: bool,
}

impl PlainTextBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK_LINES)
    }

    pub fn with_scrollback(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            cols,
            rows,
            scrollback: scrollback.max(1),
            lines: VecDeque::new(),
            current: String::new(),
            pending: Vec::new(),
            carriage_return: false,
        }
    }

    fn push_line(&mut self) {
        let line = std::mem::take(&mut self.current);
        self.lines.push_back(line);
        while self.lines.len() > self.scrollback {
            self.lines.pop_front();
        }
    }

    fn all_lines(&self) -> impl Iterator<Item = &String> {
        let current = (!self.current.is_empty()).then_some(&self.current);
        self.lines.iter().chain(current)
    }
}

impl TerminalBuffer for PlainTextBuffer {
    fn ingest(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let (text, rest) = split_complete(&self.pending);
        let rest = rest.to_vec();
        let clean = strip_ansi(&text);
        self.pending = rest;

        for c in clean.chars() {
            match c {
                '\n' => {
                    self.carriage_return = false;
                    self.push_line();
                }
                '\r' => self.carriage_return = true,
                '\x08' => {
                    self.current.pop();
                }
                c if c.is_control() && c != '\t' => {}
                c => {
                    if std::mem::take(&mut self.carriage_return) {
                        self.current.clear();
                    }
                    self.current.push(c);
                }
            }
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            cols: self.cols,
            rows: self.rows,
            lines: self.buffer_tail(usize::from(self.rows)),
        }
    }

    fn buffer_tail(&self, lines: usize) -> Vec<String> {
        let all: Vec<&String> = self.all_lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|line| (*line).clone()).collect()
    }
}

/// Split `bytes` into decodable text and a trailing remainder that may become
/// valid once more bytes arrive (a cut UTF-8 sequence or escape sequence).
fn split_complete(bytes: &[u8]) -> (String, &[u8]) {
    let (mut text, mut rest) = match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), &bytes[bytes.len()..]),
        Err(error) if error.error_len().is_none() => {
            let cut = error.valid_up_to();
            (
                String::from_utf8_lossy(&bytes[..cut]).into_owned(),
                &bytes[cut..],
            )
        }
        // Replacement characters change byte offsets, so nothing is carried.
        Err(_) => {
            return (
                String::from_utf8_lossy(bytes).into_owned(),
                &bytes[bytes.len()..],
            )
        }
    };

    if let Some(esc) = text.rfind('\x1b') {
        if !escape_terminated(&text[esc..]) {
            let carried = text.split_off(esc);
            let mut joined = carried.into_bytes();
            joined.extend_from_slice(rest);
            // Carry at most a short tail; a runaway sequence is flushed as text.
            if joined.len() <= 64 {
                let offset = bytes.len() - joined.len();
                rest = &bytes[offset..];
            } else {
                text.push_str(&String::from_utf8_lossy(&joined));
                rest = &bytes[bytes.len()..];
            }
        }
    }
    (text, rest)
}

fn escape_terminated(seq: &str) -> bool {
    let mut chars = seq.chars().skip(1);
    match chars.next() {
        None => false,
        Some('[') => chars.any(|c| c.is_ascii_alphabetic() || c == '@' || c == '`'),
        Some(']') => seq.contains('\x07') || seq.contains("\x1b\\"),
        Some('(' | ')' | '*' | '+') => chars.next().is_some(),
        Some(_) => true,
    }
}

pub(crate) fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc == '\x07' {
                        break;
                    }
                    if nc == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some('(' | ')' | '*' | '+') => {
                chars.next();
                chars.next();
            }
            Some(c) if ('0'..='~').contains(c) => {
                chars.next();
            }
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::{strip_ansi, PlainTextBuffer, TerminalBuffer};

    #[test]
    fn strips_csi_and_osc_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi("\x1b]0;title\x07prompt$ "), "prompt$ ");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn tail_includes_partial_current_line() {
        let mut buf = PlainTextBuffer::new(80, 24);
        buf.ingest(b"one\r\ntwo\r\nthr");
        assert_eq!(buf.buffer_tail(2), vec!["two", "thr"]);
        assert_eq!(buf.buffer_tail(10), vec!["one", "two", "thr"]);
    }

    #[test]
    fn bare_carriage_return_overwrites_line() {
        let mut buf = PlainTextBuffer::new(80, 24);
        buf.ingest(b"50%\r75%\r\ndone\n");
        assert_eq!(buf.buffer_tail(10), vec!["75%", "done"]);
    }

    #[test]
    fn utf8_split_across_chunks_is_reassembled() {
        let mut buf = PlainTextBuffer::new(80, 24);
        let bytes = "héllo\n".as_bytes();
        buf.ingest(&bytes[..2]);
        buf.ingest(&bytes[2..]);
        assert_eq!(buf.buffer_tail(1), vec!["héllo"]);
    }

    #[test]
    fn escape_split_across_chunks_is_not_rendered() {
        let mut buf = PlainTextBuffer::new(80, 24);
        buf.ingest(b"a\x1b[3");
        buf.ingest(b"1mb\n");
        assert_eq!(buf.buffer_tail(1), vec!["ab"]);
    }

    #[test]
    fn scrollback_is_bounded_and_snapshot_uses_rows() {
        let mut buf = PlainTextBuffer::with_scrollback(80, 2, 3);
        buf.ingest(b"1\n2\n3\n4\n5\n");
        assert_eq!(buf.buffer_tail(10), vec!["3", "4", "5"]);
        buf.resize(100, 1);
        let snap = buf.snapshot();
        assert_eq!(snap.cols, 100);
        assert_eq!(snap.lines, vec!["5"]);
    }
}
