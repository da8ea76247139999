//! SMTP command parsing.

use crate::types::{Reply, ReplyCode};

/// MAIL parameter that marks the message as 8-bit.
const BODY_8BITMIME: &str = "BODY=8BITMIME";

/// SMTP command received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// MAIL FROM - Add a sender
    MailFrom {
        /// Sender address, without the angle brackets
        from: String,
        /// `BODY=8BITMIME` was given
        mime8b: bool,
    },
    /// RCPT TO - Add a recipient
    RcptTo {
        /// Recipient address, without the angle brackets
        to: String,
    },
    /// DATA - Begin message data
    Data,
    /// QUIT - Close connection
    Quit,
}

/// A command line that could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Blank line.
    #[error("Syntax error, command unrecognized")]
    Empty,
    /// Verb this server does not know.
    #[error("Command not implemented")]
    NotImplemented(String),
    /// Required argument missing.
    #[error("parameter")]
    MissingParameter,
    /// Argument present but malformed.
    #[error("invalid parameter")]
    InvalidParameter,
}

impl CommandError {
    /// Reply code for this error.
    #[must_use]
    pub const fn code(&self) -> ReplyCode {
        match self {
            Self::Empty => ReplyCode::SYNTAX_ERROR,
            Self::NotImplemented(_) => ReplyCode::NOT_IMPLEMENTED,
            Self::MissingParameter | Self::InvalidParameter => ReplyCode::PARAMETER_ERROR,
        }
    }

    /// Reply sent to the client.
    #[must_use]
    pub fn reply(&self) -> Reply {
        Reply::single(self.code(), self.to_string())
    }
}

impl Command {
    /// Parses one command line (without its line ending).
    ///
    /// Verbs are case-insensitive. MAIL and RCPT take the address between
    /// the first `<` of the line and the `>` that follows it.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] naming the reply to send.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().ok_or(CommandError::Empty)?;
        let arg = tokens.next();

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo {
                hostname: arg.ok_or(CommandError::MissingParameter)?.to_string(),
            }),
            "EHLO" => Ok(Self::Ehlo {
                hostname: arg.ok_or(CommandError::MissingParameter)?.to_string(),
            }),
            "MAIL" => {
                arg.ok_or(CommandError::MissingParameter)?;
                let (from, params) = angle_address(line)?;
                let mime8b = params
                    .split_whitespace()
                    .any(|param| param.eq_ignore_ascii_case(BODY_8BITMIME));
                Ok(Self::MailFrom {
                    from: from.to_string(),
                    mime8b,
                })
            }
            "RCPT" => {
                arg.ok_or(CommandError::MissingParameter)?;
                let (to, _) = angle_address(line)?;
                Ok(Self::RcptTo { to: to.to_string() })
            }
            "DATA" => Ok(Self::Data),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTls),
            _ => Err(CommandError::NotImplemented(verb.to_string())),
        }
    }
}

/// Splits `...<addr> params` into the address and whatever follows it.
fn angle_address(line: &str) -> Result<(&str, &str), CommandError> {
    let start = line.find('<').ok_or(CommandError::InvalidParameter)? + 1;
    let len = line[start..]
        .find('>')
        .ok_or(CommandError::InvalidParameter)?;
    Ok((&line[start..start + len], &line[start + len + 1..]))
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

    #[test]
    fn test_greetings() {
        assert_eq!(
            Command::parse("HELO client.example.org").unwrap(),
            Command::Helo {
                hostname: "client.example.org".into()
            }
        );
        assert_eq!(
            Command::parse("ehlo c").unwrap(),
            Command::Ehlo {
                hostname: "c".into()
            }
        );
        assert_eq!(
            Command::parse("EHLO"),
            Err(CommandError::MissingParameter)
        );
    }

    #[test]
    fn test_mail_from() {
        assert_eq!(
            Command::parse("MAIL FROM:<a@x>").unwrap(),
            Command::MailFrom {
                from: "a@x".into(),
                mime8b: false
            }
        );
        assert_eq!(
            Command::parse("mail from:<a@x> body=8bitmime").unwrap(),
            Command::MailFrom {
                from: "a@x".into(),
                mime8b: true
            }
        );
        // Null reverse path
        assert_eq!(
            Command::parse("MAIL FROM:<>").unwrap(),
            Command::MailFrom {
                from: String::new(),
                mime8b: false
            }
        );
    }

    #[test]
    fn test_rcpt_to() {
        assert_eq!(
            Command::parse("RCPT TO:<b@y>").unwrap(),
            Command::RcptTo { to: "b@y".into() }
        );
        // Space before the bracket is tolerated.
        assert_eq!(
            Command::parse("RCPT TO: <b@y>").unwrap(),
            Command::RcptTo { to: "b@y".into() }
        );
    }

    #[test]
    fn test_address_errors() {
        assert_eq!(Command::parse("MAIL"), Err(CommandError::MissingParameter));
        assert_eq!(
            Command::parse("MAIL FROM:a@x"),
            Err(CommandError::InvalidParameter)
        );
        assert_eq!(
            Command::parse("RCPT TO:<b@y"),
            Err(CommandError::InvalidParameter)
        );
    }

    #[test]
    fn test_simple_verbs() {
        assert_eq!(Command::parse("DATA").unwrap(), Command::Data);
        assert_eq!(Command::parse("quit").unwrap(), Command::Quit);
        assert_eq!(Command::parse("StartTLS").unwrap(), Command::StartTls);
    }

    #[test]
    fn test_unknown_and_empty() {
        let err = Command::parse("RSET").unwrap_err();
        assert_eq!(err, CommandError::NotImplemented("RSET".into()));
        assert_eq!(err.reply().to_wire(), "502 Command not implemented\r\n");

        let err = Command::parse("   ").unwrap_err();
        assert_eq!(err, CommandError::Empty);
        assert_eq!(
            err.reply().to_wire(),
            "500 Syntax error, command unrecognized\r\n"
        );
    }

    #[test]
    fn test_parameter_replies() {
        assert_eq!(
            CommandError::MissingParameter.reply().to_wire(),
            "501 parameter\r\n"
        );
        assert_eq!(
            CommandError::InvalidParameter.reply().to_wire(),
            "501 invalid parameter\r\n"
        );
    }
}
