//! One product's live auction room.
//!
//! A room is a single-writer event loop: the worker task is the only
//! mutator of the client map and the only caller of the bid store. Every
//! other component reaches the room through the channels bundled in its
//! [`RoomHandle`]: sessions register and unregister themselves and submit
//! broadcasts; nothing else touches room state. The loop runs until the
//! auction deadline elapses or it is cancelled, then performs its terminal
//! fan-out and detaches from the lobby.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use gavel_core::{
    message::Message,
    primitive::{
        ProductId,
        UserId,
    },
};
use jiff::Timestamp;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    lobby::Lobby,
    metrics::Metrics,
    session::{
        SessionHandle,
        SessionId,
    },
    store::BidStore,
};

mod worker;
pub(crate) use worker::Worker;

/// Capacity of each of the room's inbound channels.
const INBOUND_CAPACITY: usize = 64;

/// An inbound message together with its authenticated sender.
pub(crate) struct Envelope {
    pub(crate) sender: UserId,
    pub(crate) message: Message,
}

/// Identifies a departed session on the unregister channel.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Departure {
    pub(crate) user_id: UserId,
    pub(crate) session_id: SessionId,
}

/// The channels into a live room. Cloning is cheap; all clones address the
/// same event loop.
#[derive(Clone)]
pub(crate) struct RoomHandle {
    product_id: ProductId,
    register: mpsc::Sender<SessionHandle>,
    unregister: mpsc::Sender<Departure>,
    broadcast: mpsc::Sender<Envelope>,
    done: CancellationToken,
}

impl RoomHandle {
    pub(crate) fn product_id(&self) -> ProductId {
        self.product_id
    }

    /// Attaches a session to the room.
    ///
    /// # Errors
    /// Returns an error if the room has closed.
    pub(crate) async fn register(&self, session: SessionHandle) -> Result<(), RoomClosed> {
        self.register.send(session).await.map_err(|_| RoomClosed)
    }

    /// Detaches a session. The room ignores departures it no longer knows.
    ///
    /// # Errors
    /// Returns an error if the room has closed.
    pub(crate) async fn unregister(&self, departure: Departure) -> Result<(), RoomClosed> {
        self.unregister
            .send(departure)
            .await
            .map_err(|_| RoomClosed)
    }

    /// Submits a message to the room loop on behalf of `sender`.
    ///
    /// # Errors
    /// Returns an error if the room has closed.
    pub(crate) async fn broadcast(&self, sender: UserId, message: Message) -> Result<(), RoomClosed> {
        self.broadcast
            .send(Envelope {
                sender,
                message,
            })
            .await
            .map_err(|_| RoomClosed)
    }

    /// Completes once the room's terminal path has run.
    pub(crate) async fn closed(&self) {
        self.done.cancelled().await;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("the auction room has closed")]
pub(crate) struct RoomClosed;

pub(crate) struct Builder {
    pub(crate) product_id: ProductId,
    pub(crate) auction_end: Timestamp,
    pub(crate) store: Arc<dyn BidStore>,
    pub(crate) lobby: Lobby,
    pub(crate) metrics: &'static Metrics,
    pub(crate) cancellation_token: CancellationToken,
}

impl Builder {
    /// Builds the room's handle and its not-yet-running worker.
    ///
    /// The caller attaches the handle to the lobby before spawning the
    /// worker: a worker that never runs never runs a terminal path, so a
    /// rejected attach cannot detach the room that is actually live.
    pub(crate) fn build(self) -> (RoomHandle, Worker) {
        let Self {
            product_id,
            auction_end,
            store,
            lobby,
            metrics,
            cancellation_token,
        } = self;

        let (register_tx, register_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(INBOUND_CAPACITY);
        let done = CancellationToken::new();

        let handle = RoomHandle {
            product_id,
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            done: done.clone(),
        };
        let worker = Worker {
            product_id,
            ends_at: instant_at(auction_end),
            store,
            lobby,
            metrics,
            clients: HashMap::new(),
            register: register_rx,
            unregister: unregister_rx,
            broadcast: broadcast_rx,
            cancellation_token,
            done,
        };
        (handle, worker)
    }
}

/// Converts the auction-end timestamp into a deadline on the runtime clock.
///
/// Derived from the wall clock at build time, never from a request-scoped
/// context, so cancelling the request that created the auction cannot kill
/// the room.
fn instant_at(auction_end: Timestamp) -> tokio::time::Instant {
    let remaining = Timestamp::now().duration_until(auction_end);
    let remaining = if remaining.is_negative() {
        Duration::ZERO
    } else {
        remaining.unsigned_abs()
    };
    tokio::time::Instant::now() + remaining
}

#[cfg(test)]
impl RoomHandle {
    /// A handle whose channels lead nowhere.
    pub(crate) fn dangling(product_id: ProductId) -> Self {
        let (register, _) = mpsc::channel(1);
        let (unregister, _) = mpsc::channel(1);
        let (broadcast, _) = mpsc::channel(1);
        Self {
            product_id,
            register,
            unregister,
            broadcast,
            done: CancellationToken::new(),
        }
    }
}
