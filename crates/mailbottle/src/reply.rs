//! Bottle protocol replies.
//!
//! Replies are `<code> <text>` lines. A reply may span several lines, in which
//! case every line but the last uses `-` after the code:
//! `200-first`, `200-second`, `200 last`.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Bottle reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReplyCode {
    /// 200 Bottle follows (POLL)
    pub const BOTTLE_FOLLOWS: Self = Self(200);
    /// 201 Request completed (MESSAGE, PURGE)
    pub const COMPLETED: Self = Self(201);
    /// 301 Backend busy, retry later
    pub const TRY_AGAIN: Self = Self(301);
    /// 401 Nothing to poll
    pub const POLL_EMPTY: Self = Self(401);
    /// 500 Failed to read the request
    pub const INTERNAL_ERROR: Self = Self(500);
    /// 501 Backend reported an error
    pub const FAILED: Self = Self(501);
    /// 599 Unknown command
    pub const UNKNOWN_COMMAND: Self = Self(599);
}

/// Reply from a Bottle server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code.
    pub code: ReplyCode,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![text.into()],
        }
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Converts a failure reply into an error.
    #[must_use]
    pub fn into_error(self) -> Error {
        Error::remote(self.code.as_u16(), self.message_text())
    }

    /// Serializes the reply with CRLF line endings.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.message.len().saturating_sub(1);
        if self.message.is_empty() {
            let _ = write!(out, "{}\r\n", self.code);
        }
        for (i, line) in self.message.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            let _ = write!(out, "{}{sep}{line}\r\n", self.code);
        }
        out
    }
}

/// Parses a reply from its lines, line endings already stripped.
///
/// # Errors
///
/// Returns an error if the reply is malformed.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let Some(first) = lines.first() else {
        return Err(Error::Protocol("Empty reply".into()));
    };

    let code_str = first
        .get(0..3)
        .ok_or_else(|| Error::Protocol(format!("Reply too short: {first}")))?;
    let code = code_str
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("Invalid reply code: {code_str}")))?;

    let mut message = Vec::with_capacity(lines.len());
    for line in lines {
        if !line.starts_with(code_str) {
            return Err(Error::Protocol(format!("Reply code changed mid-reply: {line}")));
        }
        match line.get(4..) {
            Some(text) => message.push(text.to_string()),
            None if line.len() == 3 => message.push(String::new()),
            None => return Err(Error::Protocol(format!("Malformed reply line: {line}"))),
        }
    }

    Ok(Reply::new(ReplyCode::new(code), message))
}

/// Checks if a line is the last line of a reply.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.len() == 3 || (line.len() >= 4 && line.as_bytes()[3] == b' ')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_reply(&["201 20260101-0001".to_string()]).unwrap();
        assert_eq!(reply.code, ReplyCode::COMPLETED);
        assert_eq!(reply.message, vec!["20260101-0001"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_poll_reply() {
        let reply = parse_reply(&["200 ID abc".to_string()]).unwrap();
        assert_eq!(reply.code, ReplyCode::BOTTLE_FOLLOWS);
        assert_eq!(reply.message_text(), "ID abc");
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let lines = vec!["501-first".to_string(), "501 second".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.message, vec!["first", "second"]);
        assert!(!reply.is_success());
    }

    #[test]
    fn test_parse_bare_code() {
        let reply = parse_reply(&["401".to_string()]).unwrap();
        assert_eq!(reply.code, ReplyCode::POLL_EMPTY);
        assert_eq!(reply.message, vec![""]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&["20".to_string()]).is_err());
        assert!(parse_reply(&["ABC OK".to_string()]).is_err());
        assert!(parse_reply(&["200-a".to_string(), "201 b".to_string()]).is_err());
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("201 ok"));
        assert!(is_last_reply_line("401"));
        assert!(!is_last_reply_line("200-more"));
        assert!(!is_last_reply_line("20"));
    }

    #[test]
    fn test_to_wire() {
        assert_eq!(
            Reply::single(ReplyCode::TRY_AGAIN, "Try-Again-Later").to_wire(),
            "301 Try-Again-Later\r\n"
        );
        let multi = Reply::new(ReplyCode::FAILED, vec!["a".into(), "b".into()]);
        assert_eq!(multi.to_wire(), "501-a\r\n501 b\r\n");
        assert_eq!(Reply::new(ReplyCode::POLL_EMPTY, vec![]).to_wire(), "401\r\n");
    }

    #[test]
    fn test_into_error() {
        let err = Reply::single(ReplyCode::TRY_AGAIN, "Try-Again-Later").into_error();
        assert!(err.is_try_again());
        assert!(!err.is_fatal());
    }
}
