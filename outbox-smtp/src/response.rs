//! SMTP reply parsing and representation.

use crate::{
    error::{ClientError, Result},
    status::SmtpCode,
};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The reply code (e.g., 220, 250, 550).
    pub code: u16,
    /// Whether this is the last line of a multi-line reply.
    pub is_last: bool,
    /// The text following the reply code.
    pub message: String,
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// The reply code looked up in the reply code table.
    #[must_use]
    pub const fn smtp_code(&self) -> SmtpCode {
        SmtpCode::from_code(self.code)
    }

    /// 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, e.g. `354` after `DATA` or `334` during `AUTH`
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// 4xx
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Returns `true` if an EHLO reply advertises the given extension keyword.
    ///
    /// The first line of an EHLO reply is the server's greeting and is skipped.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// The SASL mechanisms advertised by an EHLO reply's `AUTH` line.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let mut words = line.split(|c: char| c.is_whitespace() || c == '=');
                words
                    .next()
                    .filter(|keyword| keyword.eq_ignore_ascii_case("AUTH"))
                    .map(|_| words.filter(|w| !w.is_empty()).map(str::to_ascii_uppercase))
            })
            .flatten()
            .collect()
    }

    /// Parses a single reply line (without its line terminator).
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        }

        let code_str = &line[..3];
        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a complete reply.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut first_code = None;

        while let Some(offset) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + offset];
            consumed += offset + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;
            match first_code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
