//! DATA bridged into a queue, locally and across a Bottle connection.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use mailbottle::codec::{self, BottleInfo};
use mailbottle::framed::read_line;
use mailbottle::{Client, ClientConfig, Handler, RemoteHandler, Server, ServerConfig};
use mailbottle_queue::MemoryQueue;
use mailbottle_smtp::{Session, SmtpConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Runs a session over an in-process socket.
fn smtp(handler: Arc<dyn Handler>, config: SmtpConfig) -> BufReader<DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(Session::new(handler, Arc::new(config)).run(server_side));
    BufReader::new(client_side)
}

/// Sends `script` and returns the next `replies` reply lines.
async fn exchange(conn: &mut BufReader<DuplexStream>, script: &str, replies: usize) -> Vec<String> {
    conn.get_mut().write_all(script.as_bytes()).await.unwrap();
    let mut lines = Vec::new();
    for _ in 0..replies {
        lines.push(read_line(conn, 1024).await.unwrap().unwrap());
    }
    lines
}

async fn body_of(record: &[u8]) -> (BottleInfo, Vec<u8>) {
    let mut info = BottleInfo::new();
    let mut body = Vec::new();
    codec::read_info(record, &mut info)
        .await
        .unwrap()
        .read_to_end(&mut body)
        .await
        .unwrap();
    (info, body)
}

#[tokio::test]
async fn large_body_streams_through_small_pipe() {
    let queue = MemoryQueue::default();
    let mut conn = smtp(
        Arc::new(queue.clone()),
        SmtpConfig::new().pipe_capacity(64),
    );

    let mut body = String::new();
    let mut wire = String::new();
    for n in 0..2000 {
        let line = if n % 100 == 0 {
            format!(".dotted {n}\r\n")
        } else {
            format!("line {n}\r\n")
        };
        body.push_str(&line);
        if line.starts_with('.') {
            wire.push('.');
        }
        wire.push_str(&line);
    }
    wire.push_str(".\r\n");

    let replies = exchange(
        &mut conn,
        "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n",
        4,
    )
    .await;
    assert_eq!(replies[3], "354 start mail input");

    let replies = exchange(&mut conn, &wire, 1).await;
    assert_eq!(replies, vec!["250 OK"]);

    let stored = queue.bottles();
    assert_eq!(stored.len(), 1);
    let (_, decoded) = body_of(&stored[0].record).await;
    assert_eq!(decoded, body.as_bytes());
}

#[tokio::test]
async fn envelope_resets_between_messages() {
    let queue = MemoryQueue::default();
    let mut conn = smtp(Arc::new(queue.clone()), SmtpConfig::default());

    let replies = exchange(
        &mut conn,
        "HELO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\none\r\n.\r\n\
         MAIL FROM:<c@x>\r\nRCPT TO:<d@y>\r\nDATA\r\ntwo\r\n.\r\n",
        9,
    )
    .await;
    assert_eq!(replies[0], "220 localhost service ready");
    assert_eq!(replies[5], "250 OK");
    assert_eq!(replies[8], "354 start mail input");
    assert_eq!(read_line(&mut conn, 1024).await.unwrap().unwrap(), "250 OK");

    let stored = queue.bottles();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].info.from, vec!["c@x"]);
    assert_eq!(stored[1].info.rcpt_to, vec!["d@y"]);
}

#[tokio::test]
async fn forwards_to_remote_queue() {
    let queue = MemoryQueue::default();

    let (bottle_client, bottle_server) = tokio::io::duplex(64 * 1024);
    let server = Server::new(Arc::new(queue.clone()), ServerConfig::default());
    tokio::spawn(async move { server.serve(bottle_server).await });
    let remote = RemoteHandler::new(Arc::new(Client::new(
        bottle_client,
        ClientConfig::default(),
    )));

    let mut conn = smtp(Arc::new(remote), SmtpConfig::default());
    let replies = exchange(
        &mut conn,
        "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nhello\r\n..\r\n.\r\n",
        5,
    )
    .await;
    assert_eq!(replies[4], "250 OK");

    let stored = queue.bottles();
    assert_eq!(stored.len(), 1);
    let (info, body) = body_of(&stored[0].record).await;
    assert_eq!(info.rcpt_to, vec!["b@y"]);
    assert_eq!(body, b"hello\r\n.\r\n");
}

#[tokio::test]
async fn full_queue_is_reported() {
    let queue = MemoryQueue::new(mailbottle_queue::QueueConfig::default().capacity(0));
    let mut conn = smtp(Arc::new(queue.clone()), SmtpConfig::default());

    let replies = exchange(
        &mut conn,
        "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nhello\r\n.\r\nQUIT\r\n",
        7,
    )
    .await;
    assert_eq!(replies[4], "554 Transaction failed");
    assert_eq!(replies[5], "250 OK");
    assert_eq!(replies[6], "221 closing channel");
    assert!(queue.is_empty());
}
