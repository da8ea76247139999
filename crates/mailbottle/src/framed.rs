//! Line framing shared by the Bottle server and client.
//!
//! Commands and replies are single text lines ended by CRLF (bare LF is
//! accepted). Payloads that follow a line are dot-terminated blocks, handled
//! by [`crate::codec`].

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::reply::{Reply, is_last_reply_line, parse_reply};
use crate::{Error, Result};

/// Default maximum length of a command or reply line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Maximum number of lines in one reply.
const MAX_REPLY_LINES: usize = 128;

/// Reads one line, without its line ending.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first byte of
/// the line. A stream that ends mid-line fails with
/// [`io::ErrorKind::UnexpectedEof`]; a line longer than `max_len` fails with
/// [`io::ErrorKind::InvalidData`].
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            break;
        }

        let len = buf.len();
        line.extend_from_slice(buf);
        reader.consume(len);

        if line.len() > max_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Reads a complete, possibly multi-line, reply.
pub async fn read_reply<R>(reader: &mut R, max_len: usize) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut lines = Vec::new();

    loop {
        let line = read_line(reader, max_len).await?.ok_or(Error::Closed)?;
        let last = is_last_reply_line(&line);
        lines.push(line);

        if last {
            break;
        }
        if lines.len() >= MAX_REPLY_LINES {
            return Err(Error::Protocol("reply has too many lines".into()));
        }
    }

    parse_reply(&lines)
}

/// Runs an I/O future with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
        .map_err(Error::from)
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
    use tokio::io::BufReader;

    use super::*;
    use crate::reply::ReplyCode;

    #[tokio::test]
    async fn test_read_line_crlf_and_lf() {
        let mut reader = BufReader::new(&b"POLL\r\nPURGE x\n"[..]);
        assert_eq!(read_line(&mut reader, 100).await.unwrap().unwrap(), "POLL");
        assert_eq!(read_line(&mut reader, 100).await.unwrap().unwrap(), "PURGE x");
        assert!(read_line(&mut reader, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"MESS")
            .read(b"AGE\r")
            .read(b"\n")
            .build();
        let mut reader = BufReader::new(stream);
        assert_eq!(read_line(&mut reader, 100).await.unwrap().unwrap(), "MESSAGE");
    }

    #[tokio::test]
    async fn test_read_line_eof_mid_line() {
        let mut reader = BufReader::new(&b"POL"[..]);
        let err = read_line(&mut reader, 100).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let mut reader = BufReader::new(&b"0123456789\r\n"[..]);
        let err = read_line(&mut reader, 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_reply_multi_line() {
        let mut reader = BufReader::new(&b"501-backend\r\n501 unavailable\r\n"[..]);
        let reply = read_reply(&mut reader, 100).await.unwrap();
        assert_eq!(reply.code, ReplyCode::FAILED);
        assert_eq!(reply.message, vec!["backend", "unavailable"]);
    }

    #[tokio::test]
    async fn test_read_reply_closed() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(matches!(
            read_reply(&mut reader, 100).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
