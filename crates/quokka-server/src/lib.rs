//! Wire protocol server for QuokkaDB.
//!
//! Accepts raw MongoDB wire protocol connections and serves them through a
//! per-connection [`backend::Backend`] selected by the operation mode. One
//! tokio task per connection; inside a connection the pipeline is strictly
//! sequential. A process-wide [`CancellationToken`] stops the accept loop
//! and every live connection.

pub mod backend;
pub mod command;
pub mod conn;
pub mod handlers;
pub mod metrics;
pub mod tls;
pub mod version;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use quokka_postgres::PgStorage;

use backend::{backend_for, Mode};

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerOpts {
    /// TCP bind address for the wire protocol, e.g. `127.0.0.1:27017`.
    pub listen_addr: String,
    pub mode: Mode,
    /// Upstream MongoDB for the proxy and diff modes.
    pub proxy_addr: String,
    /// Serve TLS with a generated self-signed certificate (insecure).
    pub tls: bool,
    /// Force-close connections after this long; zero disables. Testing only.
    pub test_conn_timeout: Duration,
    /// How long shutdown waits for live connections to drain.
    pub shutdown_timeout: Duration,
}

/// A bound wire listener. Binding and serving are separate so that startup
/// failures surface before the accept loop starts, and so tests can bind
/// port zero and ask for the resulting address.
pub struct Listener {
    listener: TcpListener,
    opts: ListenerOpts,
}

impl Listener {
    pub async fn bind(opts: ListenerOpts) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&opts.listen_addr).await?;
        Ok(Listener { listener, opts })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until the token fires, then drains within the
    /// configured timeout.
    pub async fn run(self, storage: PgStorage, token: CancellationToken) -> Result<(), ServerError> {
        let Listener { listener, opts } = self;
        tracing::info!(
            addr = %listener.local_addr()?,
            mode = %opts.mode,
            tls = opts.tls,
            "listening"
        );

        let acceptor = if opts.tls {
            tracing::warn!("TLS is enabled with a self-signed certificate; this is not secure");
            Some(tls::self_signed_acceptor()?)
        } else {
            None
        };

        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            metrics::CONNECTIONS_ACCEPTED.inc();
            tracing::debug!(peer = %peer_addr, "accepted");

            let backend = backend_for(opts.mode, storage.clone(), &opts.proxy_addr);
            let conn_token = token.child_token();
            let acceptor = acceptor.clone();
            let timeout = opts.test_conn_timeout;

            tracker.spawn(async move {
                metrics::CONNECTIONS_ACTIVE.inc();

                let serve = async {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => {
                                conn::run_connection(stream, peer_addr, backend, conn_token).await;
                            }
                            Err(e) => {
                                tracing::warn!(peer = %peer_addr, error = %e, "tls handshake failed");
                            }
                        },
                        None => {
                            conn::run_connection(stream, peer_addr, backend, conn_token).await;
                        }
                    }
                };

                if timeout.is_zero() {
                    serve.await;
                } else if tokio::time::timeout(timeout, serve).await.is_err() {
                    tracing::warn!(peer = %peer_addr, "connection hit the test timeout");
                }

                metrics::CONNECTIONS_ACTIVE.dec();
                tracing::debug!(peer = %peer_addr, "closed");
            });
        }

        tracker.close();
        if opts.shutdown_timeout.is_zero() {
            tracing::info!("listener stopped");
            return Ok(());
        }

        tracing::info!(timeout = ?opts.shutdown_timeout, "listener stopped, draining connections");
        if tokio::time::timeout(opts.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("shutdown timeout reached with connections still open");
        }
        Ok(())
    }
}
