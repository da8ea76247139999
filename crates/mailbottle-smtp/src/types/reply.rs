//! SMTP reply types.

use std::fmt::{self, Write as _};

/// SMTP reply sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply message lines.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self::new(code, vec![text.into()])
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Encodes the reply: `code-text` for every line but the last, which is
    /// `code text`.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.message.len().saturating_sub(1);
        for (i, line) in self.message.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            let _ = write!(out, "{}{sep}{line}\r\n", self.code);
        }
        if self.message.is_empty() {
            let _ = write!(out, "{}\r\n", self.code);
        }
        out
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
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

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::SERVICE_READY.is_success());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::BAD_SEQUENCE.is_permanent());
            assert!(ReplyCode::TRANSACTION_FAILED.is_permanent());
            assert!(!ReplyCode::OK.is_permanent());
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert_eq!(ReplyCode::new(354), ReplyCode::START_DATA);
            assert_eq!(ReplyCode::NOT_IMPLEMENTED.as_u16(), 502);
        }
    }

    mod reply_tests {
        use super::*;

        #[test]
        fn single_line() {
            let reply = Reply::single(ReplyCode::OK, "OK");
            assert!(reply.is_success());
            assert_eq!(reply.to_wire(), "250 OK\r\n");
        }

        #[test]
        fn multi_line() {
            let reply = Reply::new(
                ReplyCode::OK,
                vec![
                    "mx.example.org".to_string(),
                    "8BITMIME".to_string(),
                    "STARTTLS".to_string(),
                ],
            );
            assert_eq!(
                reply.to_wire(),
                "250-mx.example.org\r\n250-8BITMIME\r\n250 STARTTLS\r\n"
            );
        }

        #[test]
        fn empty_message() {
            let reply = Reply::new(ReplyCode::CLOSING, vec![]);
            assert_eq!(reply.to_wire(), "221\r\n");
        }
    }
}
