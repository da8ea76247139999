//! Bottle record framing.
//!
//! A record is a short header describing the envelope, the `DATA` marker
//! line, and then the message body as a dot-terminated block:
//!
//! ```text
//! BODY-8BITMIME
//! FROM:alice@example.com
//! RCPT-TO:bob@example.org
//! DATA
//! Subject: hi
//!
//! ..leading dot escaped
//! .
//! ```
//!
//! Header lines are written with CRLF. Reading accepts CRLF or bare LF, joins
//! folded continuation lines (leading space or tab) and skips lines it does
//! not recognize.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::dot::{DotReader, DotWriter};

/// Header line that marks an 8-bit body.
pub const FLAG_8BITMIME: &str = "BODY-8BITMIME";
/// Prefix of a sender header line.
pub const FROM_PREFIX: &str = "FROM:";
/// Prefix of a recipient header line.
pub const RCPT_TO_PREFIX: &str = "RCPT-TO:";
/// Line that ends the header and starts the body.
pub const DATA_MARKER: &str = "DATA";

/// Longest physical header line accepted, in bytes.
const MAX_HEADER_LINE: usize = 16 * 1024;

/// Envelope of a bottle: who sent it, who it goes to, and the body type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BottleInfo {
    /// Sender addresses, in order.
    pub from: Vec<String>,
    /// Recipient addresses, in order.
    pub rcpt_to: Vec<String>,
    /// Body declared as 8-bit MIME.
    pub mime8b: bool,
}

impl BottleInfo {
    /// Creates an empty envelope.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            from: Vec::new(),
            rcpt_to: Vec::new(),
            mime8b: false,
        }
    }

    /// Adds a sender address.
    #[must_use]
    pub fn with_from(mut self, addr: impl Into<String>) -> Self {
        self.from.push(addr.into());
        self
    }

    /// Adds a recipient address.
    #[must_use]
    pub fn with_rcpt_to(mut self, addr: impl Into<String>) -> Self {
        self.rcpt_to.push(addr.into());
        self
    }

    /// Sets the 8-bit flag.
    #[must_use]
    pub const fn with_mime8b(mut self, mime8b: bool) -> Self {
        self.mime8b = mime8b;
        self
    }

    /// Returns true if there is at least one sender and one recipient.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.from.is_empty() && !self.rcpt_to.is_empty()
    }
}

/// Reads a record header from `src` into `info`.
///
/// Addresses are appended to the lists already in `info`. On success the
/// returned reader yields the decoded body and stops after its terminator.
///
/// # Errors
///
/// Returns [`io::ErrorKind::UnexpectedEof`] if `src` ends before the `DATA`
/// marker, and [`io::ErrorKind::InvalidData`] for oversized header lines or
/// addresses that are not UTF-8.
pub async fn read_info<R>(mut src: R, info: &mut BottleInfo) -> io::Result<DotReader<R>>
where
    R: AsyncBufRead + Unpin,
{
    let mut physical = Vec::new();
    loop {
        read_line(&mut src, &mut physical).await?;
        let mut logical = std::mem::take(&mut physical);

        if logical != DATA_MARKER.as_bytes() {
            while matches!(src.fill_buf().await?.first(), Some(b' ' | b'\t')) {
                read_line(&mut src, &mut physical).await?;
                let start = physical
                    .iter()
                    .position(|b| !matches!(b, b' ' | b'\t'))
                    .unwrap_or(physical.len());
                logical.extend_from_slice(&physical[start..]);
            }
        }

        if logical == DATA_MARKER.as_bytes() {
            return Ok(DotReader::new(src));
        } else if logical.starts_with(FLAG_8BITMIME.as_bytes()) {
            info.mime8b = true;
        } else if let Some(addr) = logical.strip_prefix(FROM_PREFIX.as_bytes()) {
            info.from.push(address(addr)?);
        } else if let Some(addr) = logical.strip_prefix(RCPT_TO_PREFIX.as_bytes()) {
            info.rcpt_to.push(address(addr)?);
        } else {
            tracing::trace!(
                line = %String::from_utf8_lossy(&logical),
                "skipping unknown bottle header line"
            );
        }
    }
}

fn address(raw: &[u8]) -> io::Result<String> {
    std::str::from_utf8(raw).map(str::to_string).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "bottle address is not UTF-8")
    })
}

/// Reads one physical line into `line`, without its line ending.
async fn read_line<R>(src: &mut R, line: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let limit = MAX_HEADER_LINE as u64 + 1;
    let n = (&mut *src).take(limit).read_until(b'\n', line).await?;

    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "bottle header ended before DATA",
        ));
    }
    if line.last() != Some(&b'\n') {
        if n > MAX_HEADER_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bottle header line too long",
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "bottle header ended mid-line",
        ));
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(())
}

/// Writes the header for `info` to `dst` and returns a writer for the body.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] if an address contains a line
/// break, or any error from `dst`.
pub async fn write_info<W>(mut dst: W, info: &BottleInfo) -> io::Result<BodyWriter<W>>
where
    W: AsyncWrite + Unpin,
{
    let mut header = BytesMut::new();
    if info.mime8b {
        put_line(&mut header, FLAG_8BITMIME, "")?;
    }
    for addr in &info.from {
        put_line(&mut header, FROM_PREFIX, addr)?;
    }
    for addr in &info.rcpt_to {
        put_line(&mut header, RCPT_TO_PREFIX, addr)?;
    }
    put_line(&mut header, DATA_MARKER, "")?;

    dst.write_all(&header).await?;
    Ok(BodyWriter {
        inner: DotWriter::new(dst),
    })
}

fn put_line(header: &mut BytesMut, prefix: &str, value: &str) -> io::Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("line break in bottle header value: {value:?}"),
        ));
    }
    header.put_slice(prefix.as_bytes());
    header.put_slice(value.as_bytes());
    header.put_slice(b"\r\n");
    Ok(())
}

/// Encodes a complete record into memory.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] if an address contains a line
/// break.
pub async fn encode(info: &BottleInfo, body: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = write_info(Vec::new(), info).await?;
    writer.write_all(body).await?;
    writer.finish().await
}

/// Body half of a record being written.
///
/// Write the raw body, then call [`close`](Self::close). Dots are escaped on
/// the way through.
#[derive(Debug)]
pub struct BodyWriter<W> {
    inner: DotWriter<W>,
}

impl<W: AsyncWrite + Unpin> BodyWriter<W> {
    /// Terminates the body, flushes, and shuts the sink down.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to or shutting down the sink fails.
    pub async fn close(self) -> io::Result<()> {
        let mut sink = self.inner.finish().await?;
        sink.shutdown().await
    }

    /// Terminates the body and returns the sink without shutting it down.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the sink fails.
    pub async fn finish(self) -> io::Result<W> {
        self.inner.finish().await
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BodyWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
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
    use tokio::io::{AsyncReadExt, BufReader};

    use super::*;

    async fn decode(record: &[u8]) -> (BottleInfo, Vec<u8>) {
        let mut info = BottleInfo::new();
        let mut body = Vec::new();
        let mut reader = read_info(record, &mut info).await.unwrap();
        reader.read_to_end(&mut body).await.unwrap();
        (info, body)
    }

    fn sample_info() -> BottleInfo {
        BottleInfo::new()
            .with_from("a@x")
            .with_rcpt_to("b@y")
            .with_rcpt_to("c@y")
            .with_mime8b(true)
    }

    #[tokio::test]
    async fn test_header_layout() {
        let record = encode(&sample_info(), b"hi\r\n").await.unwrap();
        assert_eq!(
            record,
            b"BODY-8BITMIME\r\nFROM:a@x\r\nRCPT-TO:b@y\r\nRCPT-TO:c@y\r\nDATA\r\nhi\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn test_round_trip_with_dot_line() {
        let body = b"Subject: test\r\n\r\n.\r\nafter the dot\r\n";
        let record = encode(&sample_info(), body).await.unwrap();
        let (info, decoded) = decode(&record).await;
        assert_eq!(info, sample_info());
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn test_round_trip_empty_body() {
        let record = encode(&sample_info(), b"").await.unwrap();
        let (info, decoded) = decode(&record).await;
        assert_eq!(info, sample_info());
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_no_flag_line_without_mime8b() {
        let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");
        let record = encode(&info, b"x\r\n").await.unwrap();
        assert!(record.starts_with(b"FROM:a@x\r\n"));
        let (decoded, _) = decode(&record).await;
        assert!(!decoded.mime8b);
    }

    #[tokio::test]
    async fn test_read_accepts_bare_lf() {
        let (info, body) = decode(b"FROM:a@x\nRCPT-TO:b@y\nDATA\nbody\n.\n").await;
        assert_eq!(info.from, vec!["a@x"]);
        assert_eq!(info.rcpt_to, vec!["b@y"]);
        assert_eq!(body, b"body\n");
    }

    #[tokio::test]
    async fn test_read_joins_continuations() {
        let (info, _) = decode(b"FROM:very-long\r\n \t-address@x\r\nDATA\r\n.\r\n").await;
        assert_eq!(info.from, vec!["very-long-address@x"]);
    }

    #[tokio::test]
    async fn test_read_skips_unknown_lines() {
        let (info, _) =
            decode(b"X-TRACE:abc\r\nFROM:a@x\r\nSOMETHING\r\nRCPT-TO:b@y\r\nDATA\r\n.\r\n").await;
        assert_eq!(info.from, vec!["a@x"]);
        assert_eq!(info.rcpt_to, vec!["b@y"]);
    }

    #[tokio::test]
    async fn test_read_appends_to_existing_lists() {
        let mut info = BottleInfo::new().with_from("first@x");
        read_info(&b"FROM:second@x\r\nDATA\r\n.\r\n"[..], &mut info)
            .await
            .unwrap();
        assert_eq!(info.from, vec!["first@x", "second@x"]);
    }

    #[tokio::test]
    async fn test_marker_must_match_exactly() {
        let (info, body) = decode(b"DATAX\r\nFROM:a@x\r\nDATA\r\nb\r\n.\r\n").await;
        assert_eq!(info.from, vec!["a@x"]);
        assert_eq!(body, b"b\r\n");
    }

    #[tokio::test]
    async fn test_read_missing_marker() {
        let mut info = BottleInfo::new();
        let err = read_info(&b"FROM:a@x\r\n"[..], &mut info).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_rejects_non_utf8_address() {
        let mut info = BottleInfo::new();
        let err = read_info(&b"FROM:a\xff@x\r\nDATA\r\n.\r\n"[..], &mut info)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(info.from.is_empty());

        // Unknown lines are skipped whatever their bytes.
        let (info, _) = decode(b"X-\xfe\r\nRCPT-TO:b@y\r\nDATA\r\n.\r\n").await;
        assert_eq!(info.rcpt_to, vec!["b@y"]);
    }

    #[tokio::test]
    async fn test_read_leaves_trailing_bytes() {
        let mut src = BufReader::new(&b"DATA\r\nbody\r\n.\r\ntrailer"[..]);
        let mut info = BottleInfo::new();
        let mut reader = read_info(&mut src, &mut info).await.unwrap();
        reader.drain().await.unwrap();

        let mut rest = String::new();
        src.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "trailer");
    }

    #[tokio::test]
    async fn test_write_rejects_line_break_in_address() {
        let info = BottleInfo::new().with_from("a@x\r\nRCPT-TO:evil@z");
        let err = encode(&info, b"").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_close_shuts_down_pipe() {
        let (a, mut b) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            b.read_to_end(&mut out).await.unwrap();
            out
        });

        let mut writer = write_info(a, &BottleInfo::new().with_from("a@x"))
            .await
            .unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.await.unwrap(), b"FROM:a@x\r\nDATA\r\nhello\r\n.\r\n");
    }

    #[test]
    fn test_is_complete() {
        assert!(!BottleInfo::new().is_complete());
        assert!(!BottleInfo::new().with_from("a@x").is_complete());
        assert!(sample_info().is_complete());
    }
}
