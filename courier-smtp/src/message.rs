//! Plain-text message rendering.

use std::fmt::Write;

use base64::Engine;
use chrono::{DateTime, Utc};

/// Longest run of UTF-8 bytes placed in one encoded-word. 45 bytes become 60
/// base64 characters, which keeps each word inside the 75 character limit.
const ENCODED_WORD_BYTES: usize = 45;

/// RFC 5322 section 2.1.1 limit on a line, excluding the CRLF.
const MAX_LINE_OCTETS: usize = 998;

/// Headers and body of a single `text/plain` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub date: DateTime<Utc>,
    pub message_id: &'a str,
}

impl Message<'_> {
    /// Render the message with CRLF line endings, ready for DATA.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 512);

        header(
            &mut out,
            "Date",
            &self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
        );
        header(&mut out, "From", &single_line(self.from));
        header(&mut out, "To", &single_line(self.to));
        header(&mut out, "Subject", &encode_header_value(&single_line(self.subject)));
        header(&mut out, "Message-ID", &format!("<{}>", self.message_id));
        header(&mut out, "MIME-Version", "1.0");
        header(&mut out, "Content-Type", "text/plain; charset=utf-8");

        let body = normalise_line_endings(self.body);
        if body.split("\r\n").any(|line| line.len() > MAX_LINE_OCTETS) {
            header(&mut out, "Content-Transfer-Encoding", "quoted-printable");
            out.push_str("\r\n");
            out.push_str(&quoted_printable::encode_to_str(body.as_bytes()));
        } else {
            header(&mut out, "Content-Transfer-Encoding", "8bit");
            out.push_str("\r\n");
            out.push_str(&body);
        }

        out
    }
}

/// Every line ends in CRLF, whether the input used CRLF, LF or a bare CR.
fn normalise_line_endings(body: &str) -> String {
    let unified = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len() + 16);
    for line in unified.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

fn header(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{name}: {value}\r\n");
}

/// Header values must not carry line breaks of their own.
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// RFC 2047 B-encode `value` if it is not plain ASCII.
///
/// Long values are split on character boundaries into several encoded-words
/// joined by folding whitespace.
#[must_use]
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }

    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    format!(
        "=?UTF-8?B?{}?=",
        base64::engine::general_purpose::STANDARD.encode(chunk.as_bytes())
    )
}
