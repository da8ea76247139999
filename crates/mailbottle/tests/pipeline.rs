//! Pipelining tests: many requests on one connection, backend latency that
//! finishes them out of order, replies still in request order, and failures
//! that must not leave later requests waiting forever.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mailbottle::codec::{self, BottleInfo};
use mailbottle::{
    BodyProducer, BottleId, Client, ClientConfig, Handler, HandlerError, RemoteHandler, Server,
    ServerConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const REQUESTS: u64 = 8;

/// Takes longer for earlier requests; the body is the request's number.
#[derive(Default)]
struct Delayed {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Handler for Delayed {
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        let mut record = Vec::new();
        src.read_to_end(&mut record).await?;

        let mut info = BottleInfo::new();
        let mut body = String::new();
        codec::read_info(record.as_slice(), &mut info)
            .await?
            .read_to_string(&mut body)
            .await?;
        let n: u64 = body
            .trim()
            .parse()
            .map_err(|_| HandlerError::Invalid(body.clone()))?;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis((REQUESTS - n) * 10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(format!("bottle-{n}"))
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        Err(HandlerError::PollEmpty)
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        Err(HandlerError::NotFound(id.to_string()))
    }
}

fn record(n: u64) -> Vec<u8> {
    format!("FROM:a@x\r\nRCPT-TO:b@y\r\nDATA\r\n{n}\r\n.\r\n").into_bytes()
}

#[tokio::test(start_paused = true)]
async fn replies_follow_request_order() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let handler = Arc::new(Delayed::default());
    let server = Server::new(handler.clone(), ServerConfig::default());
    let serving = tokio::spawn(async move { server.serve(server_side).await });

    // Send every request before reading any reply.
    let (read_half, mut write_half) = tokio::io::split(client_side);
    let mut wire = Vec::new();
    for n in 0..REQUESTS {
        wire.extend_from_slice(b"MESSAGE\r\n");
        // Outer dot-block around the record; the record's own terminator
        // line gets escaped.
        let inner = record(n);
        let escaped = String::from_utf8(inner).unwrap().replace("\r\n.\r\n", "\r\n..\r\n");
        wire.extend_from_slice(escaped.as_bytes());
        wire.extend_from_slice(b".\r\n");
    }
    wire.extend_from_slice(b"POLL\r\nBOGUS\r\n");
    write_half.write_all(&wire).await.unwrap();
    write_half.shutdown().await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    for n in 0..REQUESTS {
        assert_eq!(lines.next_line().await.unwrap().unwrap(), format!("201 bottle-{n}"));
    }
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "401 Poll-Empty");
    assert_eq!(
        lines.next_line().await.unwrap().unwrap(),
        "599 Error, unknown command"
    );
    assert!(lines.next_line().await.unwrap().is_none());

    serving.await.unwrap().unwrap();
    assert!(handler.peak.load(Ordering::SeqCst) > 1, "requests never overlapped");
}

#[tokio::test(start_paused = true)]
async fn client_pairs_each_reply_with_its_request() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let server = Server::new(Arc::new(Delayed::default()), ServerConfig::default());
    tokio::spawn(async move { server.serve(server_side).await });

    let client = Arc::new(Client::new(client_side, ClientConfig::default()));
    let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");

    let mut tasks = Vec::new();
    for n in 0..REQUESTS {
        let client = Arc::clone(&client);
        let info = info.clone();
        tasks.push(tokio::spawn(async move {
            let bid = client
                .send_bottle(&info, format!("{n}\r\n").as_bytes())
                .await
                .unwrap();
            (n, bid)
        }));
    }

    for task in tasks {
        let (n, bid) = task.await.unwrap();
        assert_eq!(bid, format!("bottle-{n}"));
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_limit_is_enforced() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let handler = Arc::new(Delayed::default());
    let server = Server::new(handler.clone(), ServerConfig::default().max_in_flight(2));
    tokio::spawn(async move { server.serve(server_side).await });

    let client = Arc::new(Client::new(client_side, ClientConfig::default()));
    let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");

    let mut tasks = Vec::new();
    for n in 0..REQUESTS {
        let client = Arc::clone(&client);
        let info = info.clone();
        tasks.push(tokio::spawn(async move {
            client
                .send_bottle(&info, format!("{n}\r\n").as_bytes())
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(handler.peak.load(Ordering::SeqCst) <= 2);
}

/// Hands out `b0`, `b1`, ... up to `stock`; the first poll is slow. PURGE
/// panics, and so does the body of any bottle past `stock` when `explode`
/// is set.
struct Stocked {
    stock: usize,
    explode: bool,
    polled: AtomicUsize,
}

impl Stocked {
    const fn new(stock: usize) -> Self {
        Self {
            stock,
            explode: false,
            polled: AtomicUsize::new(0),
        }
    }
}

struct Exploding;

#[async_trait]
impl BodyProducer for Exploding {
    async fn produce(
        self: Box<Self>,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        dst.write_all(b"FROM:a@x\r\n").await?;
        panic!("body went away")
    }
}

#[async_trait]
impl Handler for Stocked {
    async fn handle_bottle(
        &self,
        _src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        Err(HandlerError::TryAgain)
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        let n = self.polled.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if n >= self.stock {
            if self.explode {
                return Ok((format!("b{n}"), Box::new(Exploding)));
            }
            return Err(HandlerError::PollEmpty);
        }
        let record = format!("FROM:a@x\r\nDATA\r\n{n}\r\n").into_bytes();
        Ok((format!("b{n}"), Box::new(record)))
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        panic!("purge of {id} exploded")
    }
}

async fn read_all_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut all = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        all.push(line);
    }
    all
}

#[tokio::test(start_paused = true)]
async fn panicking_backend_fails_only_its_command() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let server = Server::new(Arc::new(Stocked::new(1)), ServerConfig::default());
    let serving = tokio::spawn(async move { server.serve(server_side).await });

    let (read_half, mut write_half) = tokio::io::split(client_side);
    write_half
        .write_all(b"PURGE b0\r\nPOLL\r\nPURGE b0\r\nPOLL\r\n")
        .await
        .unwrap();
    write_half.shutdown().await.unwrap();

    let lines = tokio::time::timeout(Duration::from_secs(5), read_all_lines(read_half))
        .await
        .unwrap();
    assert_eq!(
        lines,
        vec![
            "501 internal backend error",
            "200 ID b0",
            "FROM:a@x",
            "DATA",
            "0",
            ".",
            "501 internal backend error",
            "401 Poll-Empty",
        ]
    );
    serving.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_body_closes_connection() {
    let handler = Stocked {
        stock: 0,
        explode: true,
        polled: AtomicUsize::new(0),
    };
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let server = Server::new(Arc::new(handler), ServerConfig::default());
    let serving = tokio::spawn(async move { server.serve(server_side).await });

    let (read_half, mut write_half) = tokio::io::split(client_side);
    write_half.write_all(b"POLL\r\nPOLL\r\n").await.unwrap();
    write_half.shutdown().await.unwrap();

    let lines = tokio::time::timeout(Duration::from_secs(5), read_all_lines(read_half))
        .await
        .unwrap();
    // Nothing may follow the broken body, not even its terminator.
    assert_eq!(lines.first().map(String::as_str), Some("200 ID b0"));
    assert_eq!(lines.iter().filter(|l| l.starts_with("200 ")).count(), 1);
    assert!(!lines.iter().any(|l| l == "."));

    let served = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();
    assert!(served.is_err());
}

#[tokio::test(start_paused = true)]
async fn dropped_transport_releases_pipelined_requests() {
    let (mut client_side, server_side) = tokio::io::duplex(64 * 1024);
    let server = Server::new(Arc::new(Stocked::new(8)), ServerConfig::default());
    let serving = tokio::spawn(async move { server.serve(server_side).await });

    client_side
        .write_all(b"POLL\r\nPOLL\r\nPOLL\r\nPOLL\r\n")
        .await
        .unwrap();
    drop(client_side);

    let served = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("server stalled after the peer went away")
        .unwrap();
    assert!(served.is_err());
}

#[tokio::test(start_paused = true)]
async fn pipelined_polls_through_remote_handler() {
    // upstream queue <- RemoteHandler <- front server <- raw client
    let (up_client, up_server) = tokio::io::duplex(64 * 1024);
    let upstream = Server::new(Arc::new(Stocked::new(2)), ServerConfig::default());
    tokio::spawn(async move { upstream.serve(up_server).await });

    let remote = RemoteHandler::new(Arc::new(Client::new(up_client, ClientConfig::default())));
    let (front_client, front_server) = tokio::io::duplex(64 * 1024);
    let front = Server::new(Arc::new(remote), ServerConfig::default());
    let serving = tokio::spawn(async move { front.serve(front_server).await });

    let (read_half, mut write_half) = tokio::io::split(front_client);
    write_half
        .write_all(b"POLL\r\nPOLL\r\nPOLL\r\n")
        .await
        .unwrap();
    write_half.shutdown().await.unwrap();

    let lines = tokio::time::timeout(Duration::from_secs(5), read_all_lines(read_half))
        .await
        .expect("pipelined polls never answered");
    assert_eq!(
        lines,
        vec![
            "200 ID b0",
            "FROM:a@x",
            "DATA",
            "0",
            ".",
            "200 ID b1",
            "FROM:a@x",
            "DATA",
            "1",
            ".",
            "401 Poll-Empty",
        ]
    );
    serving.await.unwrap().unwrap();
}
