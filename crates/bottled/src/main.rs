//! `bottled` - mail bottle daemon
//!
//! Accepts mail over SMTP and keeps it in an in-memory bottle queue that
//! delivery agents drain over the Bottle protocol (POLL, then PURGE once
//! delivered). With `upstream` set, SMTP mail is forwarded to another
//! Bottle server instead.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use mailbottle::{Client, ClientConfig, Handler, RemoteHandler, Server};
use mailbottle_queue::MemoryQueue;
use mailbottle_smtp::{Session, SmtpConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::DaemonConfig;

/// Mail bottle daemon: SMTP intake and a Bottle protocol queue
#[derive(Parser, Debug)]
#[command(name = "bottled")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SMTP listen address (overrides the configuration file)
    #[arg(long)]
    smtp_listen: Option<SocketAddr>,

    /// Bottle protocol listen address (overrides the configuration file)
    #[arg(long)]
    bottle_listen: Option<SocketAddr>,

    /// Hostname announced to SMTP clients (overrides the configuration file)
    #[arg(long)]
    hostname: Option<String>,
}

/// Where SMTP sessions deliver.
#[derive(Clone)]
enum Backend {
    Local(Arc<dyn Handler>),
    Upstream(SocketAddr, ClientConfig),
}

impl Backend {
    /// Handler for one SMTP session. Upstream sessions get their own
    /// Bottle connection.
    async fn handler(&self) -> std::io::Result<Arc<dyn Handler>> {
        match self {
            Self::Local(handler) => Ok(Arc::clone(handler)),
            Self::Upstream(addr, config) => {
                let stream = TcpStream::connect(addr).await?;
                let client = Client::new(stream, config.clone());
                Ok(Arc::new(RemoteHandler::new(Arc::new(client))))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bottled=info,mailbottle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(addr) = cli.smtp_listen {
        config.smtp_listen = Some(addr);
    }
    if let Some(addr) = cli.bottle_listen {
        config.bottle_listen = Some(addr);
    }
    if let Some(hostname) = cli.hostname {
        config.hostname = hostname;
    }

    if config.smtp_listen.is_none() && config.bottle_listen.is_none() {
        bail!("nothing to serve: neither smtp_listen nor bottle_listen is set");
    }

    let queue = MemoryQueue::new(config.queue.clone());
    let mut listeners = JoinSet::new();

    if let Some(addr) = config.bottle_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding Bottle listener on {addr}"))?;
        info!(%addr, "serving Bottle protocol");
        let server = Server::new(Arc::new(queue.clone()), config.server_config());
        listeners.spawn(serve_bottle(listener, server));
    }

    if let Some(addr) = config.smtp_listen {
        let smtp = Arc::new(config.smtp_config()?);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding SMTP listener on {addr}"))?;
        let backend = match config.upstream {
            Some(upstream) => {
                info!(%addr, %upstream, tls = smtp.tls.is_some(), "serving SMTP, forwarding upstream");
                Backend::Upstream(upstream, config.client_config())
            }
            None => {
                info!(%addr, tls = smtp.tls.is_some(), "serving SMTP");
                Backend::Local(Arc::new(queue.clone()))
            }
        };
        listeners.spawn(serve_smtp(listener, backend, smtp));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!(queued = queue.len(), "shutting down");
        }
        Some(result) = listeners.join_next() => {
            result.context("listener task failed")?;
        }
    }

    listeners.shutdown().await;
    Ok(())
}

async fn serve_bottle(listener: TcpListener, server: Server) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let server = server.clone();
        tokio::spawn(
            async move {
                info!("connected");
                match server.serve(stream).await {
                    Ok(()) => info!("disconnected"),
                    Err(e) => warn!(error = %e, "connection failed"),
                }
            }
            .instrument(info_span!("bottle", %peer)),
        );
    }
}

async fn serve_smtp(listener: TcpListener, backend: Backend, config: Arc<SmtpConfig>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let backend = backend.clone();
        let config = Arc::clone(&config);
        tokio::spawn(
            async move {
                let handler = match backend.handler().await {
                    Ok(handler) => handler,
                    Err(e) => {
                        warn!(error = %e, "upstream unavailable, dropping client");
                        return;
                    }
                };
                info!("connected");
                match Session::new(handler, config).run(stream).await {
                    Ok(()) => info!("disconnected"),
                    Err(e) => warn!(error = %e, "session failed"),
                }
            }
            .instrument(info_span!("smtp", %peer)),
        );
    }
}
