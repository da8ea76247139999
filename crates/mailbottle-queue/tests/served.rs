//! The memory queue behind a Bottle server, driven by a Bottle client.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use mailbottle::{BottleInfo, Client, ClientConfig, Error, Server, ServerConfig};
use mailbottle_queue::{MemoryQueue, QueueConfig};
use tokio::io::DuplexStream;

fn serve(queue: MemoryQueue) -> Client<DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(16 * 1024);
    let server = Server::new(Arc::new(queue), ServerConfig::default());
    tokio::spawn(async move { server.serve(server_side).await });
    Client::new(client_side, ClientConfig::default())
}

fn envelope() -> BottleInfo {
    BottleInfo::new().with_from("a@x").with_rcpt_to("b@y")
}

#[tokio::test]
async fn message_poll_purge() {
    let queue = MemoryQueue::default();
    let client = serve(queue.clone());

    let bid = client
        .send_bottle(&envelope(), b"Subject: hi\r\n\r\nhello\r\n")
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get(&bid).unwrap().info, envelope());

    let polled = client.poll().await.unwrap().unwrap();
    assert_eq!(polled.id, bid);
    let record = polled.body.read_to_end().await.unwrap();
    assert_eq!(record, queue.get(&bid).unwrap().record);

    // Leased: a second poll sees nothing.
    assert!(client.poll().await.unwrap().is_none());

    client.purge(&bid).await.unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn full_queue_replies_try_again() {
    let client = serve(MemoryQueue::new(QueueConfig::default().capacity(1)));

    client.send_bottle(&envelope(), b"one\r\n").await.unwrap();
    let err = client.send_bottle(&envelope(), b"two\r\n").await.unwrap_err();
    assert!(err.is_try_again());

    // The connection survives a refusal.
    let polled = client.poll().await.unwrap().unwrap();
    let record = polled.body.read_to_end().await.unwrap();
    assert!(record.ends_with(b"one\r\n.\r\n"));
}

#[tokio::test]
async fn envelope_without_recipient_is_rejected() {
    let client = serve(MemoryQueue::default());
    let err = client
        .send_bottle(&BottleInfo::new().with_from("a@x"), b"x\r\n")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { code: 501, .. }));
}

#[tokio::test]
async fn purge_unknown_bid() {
    let client = serve(MemoryQueue::default());
    let err = client.purge("20260101000000-000042").await.unwrap_err();
    assert!(matches!(err, Error::Remote { code: 501, .. }));
}
