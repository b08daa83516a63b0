//! The `quokkadb` binary.
//!
//! Wires flags, logging, the shared PostgreSQL pool, the debug endpoint and
//! the wire listener together, and turns SIGINT/SIGTERM into a cancellation
//! token that drains the whole process.

mod debug;

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use quokka_postgres::PgStorage;
use quokka_server::backend::Mode;
use quokka_server::version::gateway_version;
use quokka_server::{Listener, ListenerOpts};

#[derive(Parser)]
#[command(name = "quokkadb", about = "MongoDB wire protocol gateway backed by PostgreSQL")]
struct Cli {
    /// Wire protocol listen address
    #[arg(long, default_value = "127.0.0.1:27017", env = "QUOKKADB_LISTEN_ADDR")]
    listen_addr: String,

    /// Debug endpoint (health, metrics) listen address
    #[arg(long, default_value = "127.0.0.1:8088", env = "QUOKKADB_DEBUG_ADDR")]
    debug_addr: String,

    /// Operation mode: normal, proxy, diff-normal or diff-proxy
    #[arg(long, default_value = "normal", env = "QUOKKADB_MODE")]
    mode: Mode,

    /// Upstream MongoDB address for the proxy and diff modes
    #[arg(long, default_value = "127.0.0.1:37017", env = "QUOKKADB_PROXY_ADDR")]
    proxy_addr: String,

    /// PostgreSQL connection URL
    #[arg(
        long,
        default_value = "postgres://postgres@127.0.0.1:5432/quokkadb",
        env = "QUOKKADB_POSTGRES_URL"
    )]
    postgres_url: String,

    /// Serve TLS with a generated self-signed certificate (insecure)
    #[arg(long, env = "QUOKKADB_TLS")]
    tls: bool,

    /// Force-close connections after this many seconds (testing; 0 = off)
    #[arg(long, default_value = "0", env = "QUOKKADB_TEST_CONN_TIMEOUT")]
    test_conn_timeout: u64,

    /// Seconds to wait for connections to drain on shutdown (0 = immediate)
    #[arg(long, default_value = "0", env = "QUOKKADB_SHUTDOWN_TIMEOUT")]
    shutdown_timeout: u64,

    /// Print the version and exit
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("quokkadb {}", gateway_version());
        return std::process::ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quokka=info,quokkadb=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = gateway_version(),
        mode = %cli.mode,
        "starting quokkadb"
    );

    if cli.tls {
        tracing::warn!("the current TLS implementation is not secure");
    }

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let storage = match PgStorage::connect(&cli.postgres_url).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to PostgreSQL");
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!("connected to PostgreSQL");

    tokio::spawn({
        let token = token.clone();
        let debug_addr = cli.debug_addr.clone();
        async move {
            if let Err(e) = debug::serve(debug_addr, token).await {
                tracing::error!(error = %e, "debug endpoint failed");
            }
        }
    });

    let listener = match Listener::bind(ListenerOpts {
        listen_addr: cli.listen_addr.clone(),
        mode: cli.mode,
        proxy_addr: cli.proxy_addr.clone(),
        tls: cli.tls,
        test_conn_timeout: Duration::from_secs(cli.test_conn_timeout),
        shutdown_timeout: Duration::from_secs(cli.shutdown_timeout),
    })
    .await
    {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %cli.listen_addr, "failed to bind");
            return std::process::ExitCode::FAILURE;
        }
    };

    match listener.run(storage, token).await {
        Ok(()) => {
            tracing::info!("stopped");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "listener failed");
            std::process::ExitCode::FAILURE
        }
    }
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        token.cancel();
    });
}
