//! Slow-log parser contract.
//!
//! Parsing the slow log is pluggable: workers consume whatever a
//! [`ParserFactory`] builds over the interval's byte window. The built-in
//! [`TextParserFactory`] understands the common textual format (header
//! lines starting with `#`, statements terminated by `;`) well enough to
//! wire the pipeline end-to-end; a richer parser can be dropped in without
//! touching the workers.

use std::io::BufRead;

use thiserror::Error;

use sha2::{Digest, Sha256};

/// One parsed query event. `offset` is the absolute byte offset just past
/// the event in the underlying file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogEvent {
    pub offset: u64,
    pub query: String,
    pub query_time: f64,
    pub lock_time: f64,
    pub rows_sent: u64,
    pub rows_examined: u64,
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming event source over one interval.
pub trait LogParser: Send {
    /// Returns the next complete event, or `None` at the end of the window.
    fn next_event(&mut self) -> Result<Option<LogEvent>, ParserError>;
}

/// Builds a parser over a reader positioned at `start_offset`.
pub trait ParserFactory: Send + Sync + 'static {
    fn make(&self, reader: Box<dyn BufRead + Send>, start_offset: u64) -> Box<dyn LogParser>;
}

/// Factory for the built-in textual parser.
#[derive(Default)]
pub struct TextParserFactory;

impl ParserFactory for TextParserFactory {
    fn make(&self, reader: Box<dyn BufRead + Send>, start_offset: u64) -> Box<dyn LogParser> {
        Box::new(TextLogParser {
            reader,
            offset: start_offset,
        })
    }
}

struct TextLogParser {
    reader: Box<dyn BufRead + Send>,
    offset: u64,
}

impl LogParser for TextLogParser {
    fn next_event(&mut self) -> Result<Option<LogEvent>, ParserError> {
        let mut event = LogEvent::default();
        let mut sql = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                // A statement without its terminator is an incomplete
                // event; it will reappear whole in the next interval.
                return Ok(None);
            }
            self.offset += n as u64;

            let trimmed = line.trim_end();
            if trimmed.starts_with('#') {
                parse_header(trimmed, &mut event);
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_ascii_lowercase();
            if lower.starts_with("set timestamp") || lower.starts_with("use ") {
                continue;
            }

            if !sql.is_empty() {
                sql.push(' ');
            }
            sql.push_str(trimmed);

            if trimmed.ends_with(';') {
                sql.truncate(sql.len() - 1);
                event.query = sql;
                event.offset = self.offset;
                return Ok(Some(event));
            }
        }
    }
}

fn parse_header(line: &str, event: &mut LogEvent) {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        let Some(key) = token.strip_suffix(':') else {
            continue;
        };
        let Some(value) = tokens.peek() else {
            break;
        };
        match key {
            "Query_time" => event.query_time = value.parse().unwrap_or(0.0),
            "Lock_time" => event.lock_time = value.parse().unwrap_or(0.0),
            "Rows_sent" => event.rows_sent = value.parse().unwrap_or(0),
            "Rows_examined" => event.rows_examined = value.parse().unwrap_or(0),
            _ => {}
        }
    }
}

/// Normalizes a statement into its class fingerprint: lowercased, literals
/// and numbers replaced with `?`, whitespace collapsed.
pub fn fingerprint(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                let mut escaped = false;
                for inner in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if inner == '\\' {
                        escaped = true;
                    } else if inner == quote {
                        break;
                    }
                }
                out.push('?');
            }
            c if c.is_ascii_digit() => {
                let standalone = !out
                    .chars()
                    .next_back()
                    .is_some_and(|p| p.is_ascii_alphanumeric() || p == '_' || p == '?');
                if standalone {
                    // Swallow the rest of the literal ("42", "0.25", ...).
                    while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                        chars.next();
                    }
                    out.push('?');
                } else {
                    // Digit inside an identifier ("t1", "col2") stays.
                    out.push(c);
                }
            }
            c if c.is_whitespace() => {
                if !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            c => out.push(c.to_ascii_lowercase()),
        }
    }

    out.trim().to_string()
}

/// Derives the stable class id from a fingerprint: the first 16 hex digits
/// of its SHA-256, uppercased.
pub fn class_id(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    digest[..8].iter().map(|b| format!("{:02X}", b)).collect()
}
