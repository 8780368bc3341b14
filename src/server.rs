//! Listener supervision.
//!
//! One accept-loop task per configured listener, serving HTTP/1.1 and
//! HTTP/2 through the auto connection builder, with optional TLS
//! termination. Every accepted connection is spawned into the loop's
//! `JoinSet`; stopping a listener closes its socket, signals each
//! connection to finish its in-flight request, then reaps the set with
//! a bounded grace deadline and aborts whatever remains.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use rulegate_core::ProxyError;

use crate::handler::{handle_request, ListenerState, ReadyConfig};
use crate::tls;

/// How long a stopping listener waits for in-flight connections.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// A running listener: its accept task plus the knobs to stop it.
pub struct ListenerHandle {
    listen: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The address actually bound (resolves `:0` port requests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configured listen string.
    pub fn listen(&self) -> &str {
        &self.listen
    }
}

/// Binds and starts every listener of the config.
///
/// On any bind failure the already-started listeners are stopped and
/// the error is returned, so startup is all-or-nothing.
pub async fn start_listeners(ready: Arc<ReadyConfig>) -> Result<Vec<ListenerHandle>, ProxyError> {
    let mut handles = Vec::with_capacity(ready.config.proxies.len());
    for index in 0..ready.config.proxies.len() {
        match start_listener(ready.clone(), index).await {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                stop_listeners(handles).await;
                return Err(err);
            }
        }
    }
    Ok(handles)
}

/// Stops all listeners in parallel, each draining with the grace
/// period.
pub async fn stop_listeners(handles: Vec<ListenerHandle>) {
    let tasks: Vec<JoinHandle<()>> = handles
        .into_iter()
        .map(|handle| {
            let _ = handle.shutdown.send(true);
            handle.task
        })
        .collect();
    for task in tasks {
        let _ = task.await;
    }
}

async fn start_listener(
    ready: Arc<ReadyConfig>,
    index: usize,
) -> Result<ListenerHandle, ProxyError> {
    let proxy = &ready.config.proxies[index];
    let listen = proxy.listen.clone();

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|err| ProxyError::Listener(format!("failed to bind {listen}: {err}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| ProxyError::Listener(format!("failed to read bound address: {err}")))?;

    let acceptor = match (&proxy.ssl_cert, &proxy.ssl_key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        _ => None,
    };

    let state = Arc::new(ListenerState::new(ready.clone(), index)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(
        listen = %listen,
        addr = %local_addr,
        target = %proxy.target,
        tls = acceptor.is_some(),
        "listener started"
    );

    let task = tokio::spawn(accept_loop(listener, acceptor, state, shutdown_rx));

    Ok(ListenerHandle {
        listen,
        local_addr,
        shutdown: shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                debug!(%addr, "new connection");

                connections.spawn(serve_connection(
                    stream,
                    acceptor.clone(),
                    state.clone(),
                    shutdown.clone(),
                    addr,
                ));
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            _ = shutdown.changed() => break,
        }
    }

    // Socket closes as soon as the loop exits. Each connection has
    // seen the shutdown signal and will close once its in-flight
    // request finishes; reap them until the grace deadline.
    drop(listener);
    drain_connections(&mut connections).await;
}

/// Reaps the connection set until it is empty or the grace deadline
/// passes, then aborts the stragglers.
async fn drain_connections(connections: &mut JoinSet<()>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    while !connections.is_empty() {
        match tokio::time::timeout_at(deadline, connections.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    remaining = connections.len(),
                    "drain grace period expired; force-closing connections"
                );
                connections.abort_all();
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ListenerState>,
    shutdown: watch::Receiver<bool>,
    addr: SocketAddr,
) {
    let served = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => drive_connection(tls_stream, state, shutdown).await,
            Err(err) => {
                warn!(%addr, error = %err, "TLS handshake failed");
                return;
            }
        },
        None => drive_connection(stream, state, shutdown).await,
    };

    if let Err(err) = served {
        debug!(%addr, error = %err, "connection ended with error");
    }
}

/// Serves one connection, finishing in-flight requests before closing
/// when a shutdown is signalled.
async fn drive_connection<I>(
    io: I,
    state: Arc<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn({
        let state = state.clone();
        move |req| handle_request(req, state.clone())
    });
    let builder = auto::Builder::new(TokioExecutor::new());

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        served = conn.as_mut() => served,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    }
}

/// Startup summary: what is bound, where it forwards, what is watched.
pub fn print_startup_info(ready: &ReadyConfig) {
    println!(
        "rulegate v{}: {} listener(s), {} watched file(s)",
        env!("CARGO_PKG_VERSION"),
        ready.config.proxies.len(),
        ready.watched_files.len()
    );
    for proxy in &ready.config.proxies {
        let scheme = if proxy.has_tls() { "https" } else { "http" };
        println!(
            "  {scheme}://{}  ->  {}  ({} rules, timeout {}s{})",
            proxy.listen,
            proxy.target,
            proxy.rules.len(),
            proxy.timeout_duration().as_secs(),
            if proxy.debug { ", debug" } else { "" }
        );
    }
}
