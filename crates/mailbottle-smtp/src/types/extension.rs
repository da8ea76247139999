//! SMTP extension types.

use std::fmt;

/// Extensions this server can announce in an EHLO reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// STARTTLS - TLS upgrade
    StartTls,
}

impl Extension {
    /// Returns the EHLO keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EightBitMime => "8BITMIME",
            Self::StartTls => "STARTTLS",
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str() {
        assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
        assert_eq!(Extension::StartTls.as_str(), "STARTTLS");
    }
}
