//! Listeners and per-connection session wiring.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::net::TcpListener;

#[cfg(unix)]
use tokio::net::UnixListener;

use service::{Router, Session, SessionEvent, SessionOptions, StreamIo};

use crate::{
    config::Config,
    statistics::{Statistics, Stats},
};

/// Bind the configured listeners and start accepting sessions. Failing to
/// bind either listener is fatal. Returns the tcp listener's local address
/// when one is configured.
pub async fn start(
    config: &Config,
    statistics: &Statistics,
    router: &Arc<Router>,
) -> Result<Option<SocketAddr>> {
    let mut tcp_addr = None;

    if let Some(listen) = config.server.tcp_listen {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        tcp_addr = Some(addr);

        log::info!("tcp listener bound: {}", addr);
        tokio::spawn(accept_tcp(
            listener,
            accept_options(config, router),
            statistics.clone(),
        ));
    }

    #[cfg(unix)]
    if let Some(path) = &config.server.local_socket {
        // A previous run may have left its socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;

        log::info!("local listener bound: {:?}", path);
        tokio::spawn(accept_local(
            listener,
            accept_options(config, router),
            statistics.clone(),
        ));
    }

    Ok(tcp_addr)
}

#[derive(Clone)]
struct AcceptOptions {
    name: String,
    bind_timeout: std::time::Duration,
    refresh_multiplier: u32,
    router: Arc<Router>,
}

fn accept_options(config: &Config, router: &Arc<Router>) -> AcceptOptions {
    AcceptOptions {
        name: config.name.clone(),
        bind_timeout: config.bind.timeout(),
        refresh_multiplier: config.bind.refresh_multiplier,
        router: router.clone(),
    }
}

async fn accept_tcp(listener: TcpListener, options: AcceptOptions, statistics: Statistics) {
    while let Ok((socket, addr)) = listener.accept().await {
        log::info!("tcp socket accept: addr={:?}", addr);
        tokio::spawn(serve(Box::new(socket), options.clone(), statistics.clone()));
    }
}

#[cfg(unix)]
async fn accept_local(listener: UnixListener, options: AcceptOptions, statistics: Statistics) {
    while let Ok((socket, _)) = listener.accept().await {
        log::info!("local socket accept");
        tokio::spawn(serve(Box::new(socket), options.clone(), statistics.clone()));
    }
}

/// One accepted connection: a server-role session until its transport dies.
async fn serve(stream: Box<dyn StreamIo>, options: AcceptOptions, statistics: Statistics) {
    statistics.add(Stats::Accepted);

    let (session, mut events) = Session::spawn(SessionOptions {
        name: options.name,
        bind_timeout: options.bind_timeout,
        refresh_multiplier: options.refresh_multiplier,
        resolver: Some(options.router),
    });

    if session.attach(stream).await.is_err() {
        statistics.add(Stats::Closed);
        return;
    }

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Authenticated { peer } => {
                statistics.add(Stats::Authenticated);
                log::info!("session authenticated: peer={:?}", peer);
            }
            SessionEvent::Disconnected => {
                log::info!("session disconnect");
                break;
            }
        }
    }

    statistics.add(Stats::Closed);
    log::debug!(
        "sessions: accepted={} active={}",
        statistics.accepted(),
        statistics.active()
    );
}
