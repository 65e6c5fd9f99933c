// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection

use tokio::signal::ctrl_c;

/// Future that resolves on the first `SIGINT`.
///
/// **BEWARE:** This permanently registers an interrupt handler through [`tokio`], so it
/// belongs near the program's entry point. Signals may only be detected after this is
/// first polled and several signals may be collapsed into one.
///
/// # Panics
///
/// If [`tokio::signal`] fails to register the handler.
pub async fn graceful_shutdown_requested() {
    ctrl_c().await.expect("Unable to await CTRL-C");
}

/// Future that resolves on a second `SIGINT` or any `SIGTERM`.
///
/// The same caveats as [`graceful_shutdown_requested`] apply.
///
/// # Panics
///
/// If [`tokio::signal`] fails to register a handler.
pub async fn fast_shutdown_requested() {
    let want_to_shutdown = async {
        ctrl_c().await.expect("Unable to await CTRL-C");
        ctrl_c().await.expect("Unable to await CTRL-C");
    };

    #[cfg(unix)]
    let want_to_shutdown = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Can't register SIGTERM handler");
        tokio::select! {
            _ = want_to_shutdown => {},
            _ = sigterm.recv() => {},
        };
    };

    want_to_shutdown.await
}
