//! Gavel Auctioneer runs live English-ascending auctions over websockets.
//!
//! Every product under auction gets one in-memory room. Bidders connect
//! through the HTTP edge, which upgrades their connection and attaches a
//! session to the product's room. The room is a single-writer event loop:
//! it alone mutates the set of attached sessions and it alone calls the
//! bid store, so concurrent bids serialize into a strictly increasing
//! sequence of accepted amounts.
//!
//! # Anatomy of a bid
//!
//! A bidder's frame travels: connection → session reader → the room's
//! broadcast channel → the room loop → one transactional store call →
//! either a rejection back to the sender or a confirmation to the sender
//! plus a fan-out to every other session's send queue → each session's
//! writer → connection.
//!
//! # How an auction ends
//!
//! Rooms terminate on their auction deadline (or when cancelled through
//! the service's shutdown root). The terminal path broadcasts the finished
//! notice to every remaining session with a non-blocking enqueue, drops
//! the client map (closing each session's queue), and detaches the room
//! from the lobby. Sessions wind themselves down when their queue closes,
//! their peer hangs up, or their liveness deadlines expire.

use std::{
    future::Future,
    sync::Arc,
    task::Poll,
};

pub mod config;
mod lobby;
mod metrics;
mod room;
mod server;
mod session;
pub mod store;
pub mod telemetry;
#[cfg(test)]
mod tests;
mod transport;

pub use config::Config;
use eyre::WrapErr as _;
use lobby::Lobby;
pub use metrics::Metrics;
pub use server::AuthenticatedUser;
use store::InMemoryStore;
use tokio::task::{
    JoinError,
    JoinHandle,
};
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{
    info,
    instrument,
};

/// Handle to a running auction service, obtained from [`Auctioneer::spawn`].
///
/// Await the handle to observe an unexpected exit, or call
/// [`Auctioneer::shutdown`] to end every live auction and stop serving.
pub struct Auctioneer {
    shutdown_token: CancellationToken,
    task: Option<JoinHandle<eyre::Result<()>>>,
}

impl Auctioneer {
    /// Starts the auction service on the current tokio runtime.
    #[must_use]
    pub fn spawn(cfg: Config, metrics: &'static Metrics) -> Self {
        let shutdown_token = CancellationToken::new();
        let task = tokio::spawn(run(cfg, metrics, shutdown_token.child_token()));
        Self {
            shutdown_token,
            task: Some(task),
        }
    }

    /// Cancels every live auction room and waits until their terminal
    /// fan-outs have run and the listener has stopped.
    ///
    /// # Errors
    /// Returns an error if the service task failed or panicked while
    /// winding down.
    ///
    /// # Panics
    /// Panics when invoked a second time.
    #[instrument(skip_all, err)]
    pub async fn shutdown(&mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        flatten_task_result(
            self.task
                .take()
                .expect("the auctioneer can only be shut down once")
                .await,
        )
    }
}

impl Future for Auctioneer {
    type Output = eyre::Result<()>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        use futures::future::FutureExt as _;

        let task = self
            .task
            .as_mut()
            .expect("the auctioneer future is gone once shutdown has taken it");
        task.poll_unpin(cx).map(flatten_task_result)
    }
}

async fn run(
    cfg: Config,
    metrics: &'static Metrics,
    shutdown_token: CancellationToken,
) -> eyre::Result<()> {
    let tasks = TaskTracker::new();
    let state = server::AppState {
        lobby: Lobby::new(),
        store: Arc::new(InMemoryStore::new()),
        metrics,
        shutdown_token: shutdown_token.clone(),
        tasks: tasks.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .wrap_err_with(|| format!("failed to bind `{}`", cfg.listen_addr))?;
    let local_addr = listener
        .local_addr()
        .wrap_err("failed reading the bound listener address")?;
    info!(%local_addr, "listening for bidders");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_token.clone().cancelled_owned())
        .await
        .wrap_err("the http server exited with an error")?;

    // The server only returns after the shutdown token fired, which also
    // cancelled every room; wait for their terminal fan-outs and for the
    // sessions they wind down.
    tasks.close();
    tasks.wait().await;
    Ok(())
}

/// Collapses a joined service task into one result, surfacing a panic as
/// an error report.
fn flatten_task_result<T>(res: Result<eyre::Result<T>, JoinError>) -> eyre::Result<T> {
    match res {
        Ok(Ok(val)) => Ok(val),
        Ok(Err(err)) => Err(err).wrap_err("the auctioneer task failed"),
        Err(err) => Err(err).wrap_err("the auctioneer task panicked"),
    }
}
