//! Dot-terminated block streaming.
//!
//! A block is a sequence of lines ended by a line holding a single `.`.
//! Lines that start with `.` are escaped by doubling the dot. Apart from the
//! escaping, bytes pass through unchanged: line endings are never rewritten.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const TERMINATOR: &[u8] = b".\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// At the first byte of a line.
    BeginLine,
    /// Inside a line.
    Data,
    /// A line started with `.`.
    Dot,
    /// A line started with `.\r`.
    DotCr,
    /// The terminator line has been consumed.
    Done,
}

/// Decodes a dot-terminated block from a buffered reader.
///
/// Reading returns EOF right after the terminator line; nothing beyond it is
/// consumed from the inner reader. If the inner reader ends before the
/// terminator, reading fails with [`io::ErrorKind::UnexpectedEof`].
#[derive(Debug)]
pub struct DotReader<R> {
    inner: R,
    state: ReadState,
}

impl<R> DotReader<R> {
    /// Wraps a reader positioned at the start of a block.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::BeginLine,
        }
    }

    /// Returns true once the terminator line has been read.
    pub const fn is_done(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    /// Returns a reference to the inner reader.
    pub const fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncBufRead + Unpin> DotReader<R> {
    /// Reads and discards the rest of the block.
    ///
    /// # Errors
    ///
    /// Returns an error if the inner reader fails or ends early.
    pub async fn drain(&mut self) -> io::Result<u64> {
        tokio::io::copy(self, &mut tokio::io::sink()).await
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.state == ReadState::Done || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
            if available.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "dot block ended without terminator",
                )));
            }

            let before = buf.filled().len();
            let mut consumed = 0;
            while consumed < available.len()
                && buf.remaining() > 0
                && this.state != ReadState::Done
            {
                let byte = available[consumed];
                match this.state {
                    ReadState::BeginLine => {
                        if byte == b'.' {
                            this.state = ReadState::Dot;
                            consumed += 1;
                        } else {
                            this.state = ReadState::Data;
                        }
                    }
                    ReadState::Data => {
                        buf.put_slice(&[byte]);
                        consumed += 1;
                        if byte == b'\n' {
                            this.state = ReadState::BeginLine;
                        }
                    }
                    ReadState::Dot => match byte {
                        b'\r' => {
                            this.state = ReadState::DotCr;
                            consumed += 1;
                        }
                        b'\n' => {
                            this.state = ReadState::Done;
                            consumed += 1;
                        }
                        // Escaped line: the leading dot is dropped.
                        _ => this.state = ReadState::Data,
                    },
                    ReadState::DotCr => {
                        if byte == b'\n' {
                            this.state = ReadState::Done;
                            consumed += 1;
                        } else {
                            buf.put_slice(b"\r");
                            this.state = ReadState::Data;
                        }
                    }
                    ReadState::Done => {}
                }
            }
            Pin::new(&mut this.inner).consume(consumed);

            if buf.filled().len() > before || this.state == ReadState::Done {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Encodes a dot-terminated block onto a writer.
///
/// Shutting the writer down (or calling [`DotWriter::finish`]) ends the
/// block: a line break is added if the body stopped mid-line, then the
/// terminator line is written and the inner writer flushed. The inner writer
/// itself is not shut down.
#[derive(Debug)]
pub struct DotWriter<W> {
    inner: W,
    pending: BytesMut,
    at_line_start: bool,
    terminated: bool,
}

impl<W: AsyncWrite + Unpin> DotWriter<W> {
    /// Starts a new block on `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            at_line_start: true,
            terminated: false,
        }
    }

    /// Writes the terminator, flushes, and hands back the inner writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the inner writer fails.
    pub async fn finish(mut self) -> io::Result<W> {
        self.shutdown().await?;
        Ok(self.inner)
    }

    fn encode(&mut self, data: &[u8]) {
        for line in data.split_inclusive(|&b| b == b'\n') {
            if self.at_line_start && line.first() == Some(&b'.') {
                self.pending.put_u8(b'.');
            }
            self.pending.put_slice(line);
            self.at_line_start = line.last() == Some(&b'\n');
        }
    }

    fn terminate(&mut self) {
        if !self.at_line_start {
            self.pending.put_slice(b"\r\n");
        }
        self.pending.put_slice(TERMINATOR);
        self.at_line_start = true;
        self.terminated = true;
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DotWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "dot block already terminated",
            )));
        }
        ready!(this.poll_drain(cx))?;
        this.encode(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.terminated {
            this.terminate();
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
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

    async fn encode(body: &[u8]) -> Vec<u8> {
        let mut writer = DotWriter::new(Vec::new());
        writer.write_all(body).await.unwrap();
        writer.finish().await.unwrap()
    }

    async fn decode(wire: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = DotReader::new(wire);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_encode_escapes_leading_dots() {
        let wire = encode(b"Hello\r\n.hidden\r\n..two\r\n").await;
        assert_eq!(wire, b"Hello\r\n..hidden\r\n...two\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_encode_empty_body() {
        assert_eq!(encode(b"").await, b".\r\n");
    }

    #[tokio::test]
    async fn test_encode_adds_line_break_before_terminator() {
        assert_eq!(encode(b"no newline").await, b"no newline\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_encode_escape_across_writes() {
        let mut writer = DotWriter::new(Vec::new());
        writer.write_all(b"line\n").await.unwrap();
        writer.write_all(b".dot").await.unwrap();
        writer.write_all(b".not-start\n").await.unwrap();
        let wire = writer.finish().await.unwrap();
        assert_eq!(wire, b"line\n..dot.not-start\n.\r\n");
    }

    #[tokio::test]
    async fn test_write_after_finish_fails() {
        let mut writer = DotWriter::new(Vec::new());
        writer.shutdown().await.unwrap();
        assert!(writer.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_decode_unescapes() {
        let body = decode(b"Hello\r\n..hidden\r\n.\r\n").await.unwrap();
        assert_eq!(body, b"Hello\r\n.hidden\r\n");
    }

    #[tokio::test]
    async fn test_decode_accepts_bare_lf_terminator() {
        let body = decode(b"a\n.\n").await.unwrap();
        assert_eq!(body, b"a\n");
    }

    #[tokio::test]
    async fn test_decode_dot_cr_without_lf_is_data() {
        let body = decode(b".\rx\r\n.\r\n").await.unwrap();
        assert_eq!(body, b"\rx\r\n");
    }

    #[tokio::test]
    async fn test_decode_stops_at_terminator() {
        let mut inner = BufReader::new(&b"body\r\n.\r\nNEXT\r\n"[..]);
        let mut reader = DotReader::new(&mut inner);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert!(reader.is_done());
        assert_eq!(body, b"body\r\n");

        let mut rest = String::new();
        inner.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT\r\n");
    }

    #[tokio::test]
    async fn test_decode_missing_terminator() {
        let err = decode(b"unterminated\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_drain_skips_rest() {
        let mut inner = BufReader::new(&b"skip\r\nme\r\n.\r\nafter"[..]);
        let mut reader = DotReader::new(&mut inner);
        let mut first = [0u8; 2];
        reader.read_exact(&mut first).await.unwrap();
        reader.drain().await.unwrap();

        let mut rest = String::new();
        inner.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "after");
    }

    #[tokio::test]
    async fn test_decode_one_byte_at_a_time() {
        let stream = tokio_test::io::Builder::new()
            .read(b"a")
            .read(b"\r\n.")
            .read(b".b\r")
            .read(b"\n.")
            .read(b"\r")
            .read(b"\n")
            .build();
        let mut reader = DotReader::new(BufReader::new(stream));
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"a\r\n.b\r\n");
    }

    #[tokio::test]
    async fn test_body_of_lone_dot_line() {
        let wire = encode(b".\r\n").await;
        assert_eq!(wire, b"..\r\n.\r\n");
        assert_eq!(decode(&wire).await.unwrap(), b".\r\n");
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn dot_stuffing_is_transparent(body in proptest::collection::vec(any::<u8>(), 0..512)) {
                let decoded = tokio_test::block_on(async {
                    let wire = encode(&body).await;
                    decode(&wire).await
                }).unwrap();

                let mut expected = body.clone();
                if !expected.is_empty() && expected.last() != Some(&b'\n') {
                    expected.extend_from_slice(b"\r\n");
                }
                prop_assert_eq!(decoded, expected);
            }
        }
    }
}
