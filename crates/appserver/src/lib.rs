// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server hosting the image transform proxy next to the demo task and counter streams

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

pub mod config;
pub mod opts;
pub mod response;
pub mod routes;
pub mod server;
pub mod signal;

pub use config::Config;
pub use opts::Opts;
pub use routes::AppState;
pub use server::Server;

use crate::signal::{fast_shutdown_requested, graceful_shutdown_requested};

/// Serves connections accepted from `listener` until `server` is shut down.
pub async fn serve(server: &Server, listener: TcpListener, state: Arc<AppState>) {
    let connections = futures::stream::unfold(listener, |listener| async {
        Some((listener.accept().await, listener))
    });
    server
        .serve(connections, move |request, _| {
            let state = state.clone();
            async move { routes::respond(state, request).await }
        })
        .await
}

pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let config = match &opts.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    let state = Arc::new(AppState::new(config, opts.port, opts.production)?);
    if opts.production {
        info!("Running in production mode");
    }

    let address = SocketAddr::from(([0, 0, 0, 0], opts.port));
    info!("Listening on {address}");
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Couldn't listen on port {}.", opts.port))?;

    let server = Server::new(opts.max_connections);
    let run = serve(&server, listener, state);
    let graceful_shutdown = async {
        graceful_shutdown_requested().await;
        info!("Graceful shutdown requested...");
        server.graceful_shutdown().await;
    };

    let run_until_gracefully_shutdown = async { tokio::join!(run, graceful_shutdown) };
    tokio::select! {
        biased;
        _ = fast_shutdown_requested() => info!("Fast shutdown requested..."),
        _ = run_until_gracefully_shutdown => {}
    };

    Ok(())
}
