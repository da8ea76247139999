//! End-to-end MESSAGE, POLL and PURGE between a client and a server.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use mailbottle::codec::{self, BottleInfo};
use mailbottle::{
    BodyProducer, BottleId, Client, ClientConfig, Error, Handler, HandlerError, Server,
    ServerConfig,
};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};

/// Keeps records in arrival order.
#[derive(Default)]
struct Shelf {
    bottles: Mutex<VecDeque<(BottleId, Bytes)>>,
    next: Mutex<u32>,
}

#[async_trait]
impl Handler for Shelf {
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        let mut record = Vec::new();
        src.read_to_end(&mut record).await?;
        let id = {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            format!("b{next}")
        };
        self.bottles
            .lock()
            .unwrap()
            .push_back((id.clone(), Bytes::from(record)));
        Ok(id)
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        let bottles = self.bottles.lock().unwrap();
        let (id, record) = bottles.front().ok_or(HandlerError::PollEmpty)?;
        Ok((id.clone(), Box::new(record.clone())))
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        let mut bottles = self.bottles.lock().unwrap();
        let pos = bottles
            .iter()
            .position(|(bid, _)| bid == id)
            .ok_or_else(|| HandlerError::NotFound(id.to_string()))?;
        bottles.remove(pos);
        Ok(())
    }
}

fn connect() -> Client<DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(16 * 1024);
    let server = Server::new(Arc::new(Shelf::default()), ServerConfig::default());
    tokio::spawn(async move { server.serve(server_side).await });
    Client::new(client_side, ClientConfig::default())
}

async fn decode(record: &[u8]) -> (BottleInfo, Vec<u8>) {
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
async fn poll_returns_exact_bytes() {
    let client = connect();
    let info = BottleInfo::new()
        .with_from("a@x")
        .with_rcpt_to("b@y")
        .with_rcpt_to("c@y")
        .with_mime8b(true);
    let body = b"Subject: dots\r\n\r\n.\r\n..\r\n.x\r\nend\r\n";

    let bid = client.send_bottle(&info, body).await.unwrap();

    let polled = client.poll().await.unwrap().unwrap();
    assert_eq!(polled.id, bid);
    let record = polled.body.read_to_end().await.unwrap();

    let (decoded, decoded_body) = decode(&record).await;
    assert_eq!(decoded, info);
    assert_eq!(decoded_body, body);
}

#[tokio::test]
async fn empty_body_round_trips() {
    let client = connect();
    let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");

    client.send_bottle(&info, b"").await.unwrap();
    let polled = client.poll().await.unwrap().unwrap();
    let record = polled.body.read_to_end().await.unwrap();

    let (decoded, decoded_body) = decode(&record).await;
    assert_eq!(decoded, info);
    assert!(decoded_body.is_empty());
}

#[tokio::test]
async fn poll_on_empty_queue() {
    let client = connect();
    assert!(client.poll().await.unwrap().is_none());
}

#[tokio::test]
async fn purge_removes_bottle() {
    let client = connect();
    let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");
    let bid = client.send_bottle(&info, b"hello\r\n").await.unwrap();

    let err = client.purge("unknown").await.unwrap_err();
    assert!(matches!(err, Error::Remote { code: 501, .. }));

    client.purge(&bid).await.unwrap();
    assert!(client.poll().await.unwrap().is_none());
}

#[tokio::test]
async fn dropped_poll_body_poisons_client() {
    let client = connect();
    let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");
    client.send_bottle(&info, b"hello\r\n").await.unwrap();

    let polled = client.poll().await.unwrap().unwrap();
    drop(polled);

    assert!(matches!(client.poll().await, Err(Error::Closed)));
}
