//! STARTTLS against a real rustls client.

#![allow(clippy::unwrap_used)]

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mailbottle::framed::read_line;
use mailbottle_queue::MemoryQueue;
use mailbottle_smtp::{Session, SmtpConfig, load_tls};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let mut reader = StdBufReader::new(File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn start(queue: MemoryQueue) -> (BufReader<DuplexStream>, JoinHandle<mailbottle_smtp::Result<()>>) {
    let tls = load_tls(&fixture("localhost.pem"), &fixture("localhost-key.pem")).unwrap();
    let config = Arc::new(SmtpConfig::new().tls(tls));
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn(Session::new(Arc::new(queue), config).run(server_side));
    (BufReader::new(client_side), session)
}

async fn line<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
    read_line(reader, 1024).await.unwrap().unwrap()
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, data: &str) {
    writer.write_all(data.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

#[tokio::test]
async fn mail_over_tls() {
    let queue = MemoryQueue::default();
    let (mut plain, _session) = start(queue.clone());

    assert_eq!(line(&mut plain).await, "220 localhost service ready");
    send(plain.get_mut(), "EHLO client\r\n").await;
    assert_eq!(line(&mut plain).await, "250-localhost");
    assert_eq!(line(&mut plain).await, "250-8BITMIME");
    assert_eq!(line(&mut plain).await, "250 STARTTLS");

    send(plain.get_mut(), "STARTTLS\r\n").await;
    assert_eq!(line(&mut plain).await, "220 go ahead");

    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector().connect(name, plain.into_inner()).await.unwrap();
    let mut tls = BufReader::new(tls);

    send(tls.get_mut(), "EHLO client\r\n").await;
    assert_eq!(line(&mut tls).await, "250-localhost");
    assert_eq!(line(&mut tls).await, "250 8BITMIME");

    send(tls.get_mut(), "STARTTLS\r\n").await;
    assert_eq!(line(&mut tls).await, "502 Command not implemented");

    send(tls.get_mut(), "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n").await;
    assert_eq!(line(&mut tls).await, "250 OK");
    assert_eq!(line(&mut tls).await, "250 OK");
    assert_eq!(line(&mut tls).await, "354 start mail input");
    send(tls.get_mut(), "secret\r\n.\r\nQUIT\r\n").await;
    assert_eq!(line(&mut tls).await, "250 OK");
    assert_eq!(line(&mut tls).await, "221 closing channel");

    let bottles = queue.bottles();
    assert_eq!(bottles.len(), 1);
    assert_eq!(bottles[0].info.from, vec!["a@x"]);
}

#[tokio::test]
async fn plaintext_after_starttls_is_discarded() {
    let (mut plain, _session) = start(MemoryQueue::default());
    assert_eq!(line(&mut plain).await, "220 localhost service ready");

    // Sent in the clear along with STARTTLS; must never be executed.
    send(
        plain.get_mut(),
        "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nSTARTTLS\r\nRCPT TO:<evil@x>\r\n",
    )
    .await;
    assert_eq!(line(&mut plain).await, "250 OK");
    assert_eq!(line(&mut plain).await, "250 OK");
    assert_eq!(line(&mut plain).await, "220 go ahead");

    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector().connect(name, plain.into_inner()).await.unwrap();
    let mut tls = BufReader::new(tls);

    // The first reply on the encrypted channel answers the first encrypted
    // command, and the plaintext envelope is gone.
    send(tls.get_mut(), "DATA\r\n").await;
    assert_eq!(line(&mut tls).await, "503 Bad sequence of commands");
}

#[tokio::test]
async fn failed_handshake_ends_session() {
    let (mut plain, session) = start(MemoryQueue::default());
    assert_eq!(line(&mut plain).await, "220 localhost service ready");

    send(plain.get_mut(), "STARTTLS\r\n").await;
    assert_eq!(line(&mut plain).await, "220 go ahead");
    send(plain.get_mut(), "hello, not a handshake\r\n").await;

    assert!(session.await.unwrap().is_err());
}
