//! Server harness (spec section 5 / SPEC_FULL 10.7): binds the listener,
//! serves HTTP/1.1 and optionally h2c per connection, and runs the
//! graceful-shutdown sequence (stop accepting, drain, stop tenants, exit).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::pipeline::{self, PipelineState};
use crate::tenant::TenantAppManager;

/// Binds via `listenfd` (systemd socket activation) when a pre-opened
/// socket is available at the expected fd slot, otherwise binds fresh
/// (spec 10 ambient stack: zero-downtime restarts).
fn bind_listener(addr: SocketAddr) -> anyhow::Result<std::net::TcpListener> {
    let mut listenfd = listenfd::ListenFd::from_env();
    if let Some(listener) = listenfd.take_tcp_listener(0)? {
        info!(%addr, "using socket-activated listener");
        listener.set_nonblocking(true)?;
        return Ok(listener);
    }
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Runs the accept loop until a shutdown signal arrives, then drains
/// in-flight requests and stops tenant processes before returning.
pub async fn run(
    pipeline: Arc<PipelineState>,
    tenants: Arc<TenantAppManager>,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let std_listener = bind_listener(addr)?;
    let listener = TcpListener::from_std(std_listener)?;
    info!(%addr, h2c = config.h2c_enabled, "navigator listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_signal() => {
                info!("shutdown signal received, no longer accepting connections");
                let _ = shutdown_tx.send(true);
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let pipeline = pipeline.clone();
                        let h2c_enabled = config.h2c_enabled;
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            serve_connection(stream, peer, pipeline, h2c_enabled, shutdown_rx).await;
                        });
                    }
                    Err(e) => error!(error = %e, "error accepting connection"),
                }
            }
        }
    }

    drain(&pipeline, Duration::from_secs(config.shutdown_drain_seconds)).await;

    while connections.join_next().await.is_some() {}

    tenants.shutdown_all(Duration::from_secs(config.shutdown_drain_seconds)).await;
    info!("navigator stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<PipelineState>,
    h2c_enabled: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = pipeline.clone();
        async move { Ok::<_, Infallible>(pipeline::dispatch(&pipeline, req, peer).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    if !h2c_enabled {
        builder = builder.http1_only();
    }

    let conn = builder.serve_connection_with_upgrades(io, service);
    let mut conn = Box::pin(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                warn!(error = %e, %peer, "connection error");
            }
        }
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                warn!(error = %e, %peer, "connection error during graceful shutdown");
            }
        }
    }
}

/// Waits (bounded) for the idle tracker's in-flight counter to reach zero.
async fn drain(pipeline: &PipelineState, bound: Duration) {
    let deadline = tokio::time::Instant::now() + bound;
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    loop {
        if pipeline.idle.in_flight_count() == 0 {
            info!("in-flight requests drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight = pipeline.idle.in_flight_count(), "drain deadline reached, proceeding anyway");
            return;
        }
        interval.tick().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
