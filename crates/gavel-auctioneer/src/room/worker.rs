use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt as _;
use gavel_core::{
    message::{
        Message,
        MessageKind,
    },
    primitive::{
        Money,
        ProductId,
        UserId,
    },
};
use tokio::{
    select,
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    instrument,
    warn,
};

use super::{
    Departure,
    Envelope,
};
use crate::{
    lobby::Lobby,
    metrics::Metrics,
    session::SessionHandle,
    store::{
        BidStore,
        PlaceBidError,
    },
};

pub(crate) struct Worker {
    pub(super) product_id: ProductId,
    pub(super) ends_at: Instant,
    pub(super) store: Arc<dyn BidStore>,
    pub(super) lobby: Lobby,
    pub(super) metrics: &'static Metrics,
    pub(super) clients: HashMap<UserId, SessionHandle>,
    pub(super) register: mpsc::Receiver<SessionHandle>,
    pub(super) unregister: mpsc::Receiver<Departure>,
    pub(super) broadcast: mpsc::Receiver<Envelope>,
    pub(super) cancellation_token: CancellationToken,
    /// Cancelled by the terminal path; completes `RoomHandle::closed`.
    pub(super) done: CancellationToken,
}

impl Worker {
    #[instrument(skip_all, fields(product_id = %self.product_id), ret(Display))]
    pub(crate) async fn run(mut self) -> Summary {
        self.metrics.increment_rooms_opened();
        let ends_in = self.ends_at.saturating_duration_since(Instant::now());
        info!(ends_in = %humantime::format_duration(ends_in), "auction room is open");
        let closing = self.run_event_loop().await;
        let clients_notified = self.close();
        match closing {
            Closing::DeadlineElapsed => Summary::DeadlineElapsed {
                clients_notified,
            },
            Closing::Cancelled => Summary::Cancelled {
                clients_notified,
            },
        }
    }

    async fn run_event_loop(&mut self) -> Closing {
        loop {
            select! {
                biased;

                () = self.cancellation_token.cancelled() => {
                    info!("auction was cancelled before its deadline");
                    return Closing::Cancelled;
                }

                () = tokio::time::sleep_until(self.ends_at) => {
                    info!("auction deadline elapsed");
                    return Closing::DeadlineElapsed;
                }

                Some(session) = self.register.recv() => self.register_session(session),

                Some(departure) = self.unregister.recv() => self.unregister_session(departure),

                Some(envelope) = self.broadcast.recv() => {
                    let handled = AssertUnwindSafe(self.handle_broadcast(envelope))
                        .catch_unwind()
                        .await;
                    if handled.is_err() {
                        error!("handling a broadcast panicked; the room keeps serving events");
                    }
                }
            }
        }
    }

    fn register_session(&mut self, session: SessionHandle) {
        info!(user_id = %session.user_id(), "bidder joined the auction");
        // Keyed by user id: a reconnect replaces the previous session, whose
        // queue closes when its handle is dropped here.
        self.clients.insert(session.user_id(), session);
    }

    fn unregister_session(&mut self, departure: Departure) {
        let Departure {
            user_id,
            session_id,
        } = departure;
        // Only remove the session that actually departed; a stale unregister
        // of a replaced session must not evict its successor.
        if self
            .clients
            .get(&user_id)
            .is_some_and(|current| current.session_id() == session_id)
        {
            self.clients.remove(&user_id);
            info!(%user_id, "bidder left the auction");
        }
    }

    async fn handle_broadcast(&mut self, envelope: Envelope) {
        let Envelope {
            sender,
            message,
        } = envelope;
        match message.kind {
            MessageKind::PlaceBid => self.handle_place_bid(sender, message.amount).await,
            MessageKind::InvalidJson => {
                // Parse failures loop through the broadcast channel so the
                // notice takes the same path back as any other reply.
                self.send_or_evict(sender, Message::invalid_json());
            }
            other => {
                warn!(kind = ?other, %sender, "dropping client message of outbound-only kind");
            }
        }
    }

    async fn handle_place_bid(&mut self, sender: UserId, amount: Option<Money>) {
        self.metrics.increment_bids_received();
        let Some(amount) = amount else {
            self.send_or_evict(sender, Message::failed_to_place_bid("bid is missing an amount"));
            return;
        };
        match self.store.place_bid(self.product_id, sender, amount).await {
            Ok(bid) => {
                self.metrics.increment_bids_accepted();
                info!(%sender, amount = %bid.amount, "accepted a new highest bid");
                self.send_or_evict(sender, Message::successfully_placed_bid(bid.amount, sender));
                self.fan_out(sender, Message::new_bid_placed(bid.amount, sender));
            }
            Err(rejection @ PlaceBidError::BidTooLow) => {
                self.metrics.increment_bids_rejected();
                self.send_or_evict(sender, Message::failed_to_place_bid(rejection.to_string()));
            }
            Err(PlaceBidError::ProductNotFound) => {
                // The room outlived its product row; drop the bid, the room
                // stays healthy.
                self.metrics.increment_bids_rejected();
                warn!(%sender, "dropping a bid for a product the store no longer knows");
            }
            Err(PlaceBidError::Transient {
                source,
            }) => {
                self.metrics.increment_bids_rejected();
                warn!(%sender, error = %source, "bid store failed; rejecting the bid as retriable");
                self.send_or_evict(
                    sender,
                    Message::failed_to_place_bid("could not place the bid, try again"),
                );
            }
        }
    }

    /// Replies to a single client. A full queue evicts the client so the
    /// loop never waits on a slow reader.
    fn send_or_evict(&mut self, user_id: UserId, message: Message) {
        let Some(session) = self.clients.get(&user_id) else {
            return;
        };
        match session.try_enqueue(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%user_id, "bidder is reading too slowly; evicting");
                self.metrics.increment_sessions_evicted();
                self.clients.remove(&user_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.clients.remove(&user_id);
            }
        }
    }

    /// Enqueues `message` to every client except `sender`, evicting peers
    /// whose queues are full. Dropping a peer's handle here is the close of
    /// its send queue.
    fn fan_out(&mut self, sender: UserId, message: Message) {
        let metrics = self.metrics;
        self.clients.retain(|user_id, session| {
            if *user_id == sender {
                return true;
            }
            match session.try_enqueue(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%user_id, "bidder is reading too slowly; evicting");
                    metrics.increment_sessions_evicted();
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// The terminal path: stop reading, notify everyone, leave the lobby.
    fn close(&mut self) -> usize {
        // These are the room's single closes of its inbound channels; sends
        // racing with shutdown fail instead of reaching a dead loop.
        self.register.close();
        self.unregister.close();
        self.broadcast.close();

        let mut notified = 0;
        for (user_id, session) in self.clients.drain() {
            // Non-blocking: a full or closed queue simply misses the notice.
            match session.try_enqueue(Message::auction_finished()) {
                Ok(()) => notified += 1,
                Err(_) => warn!(%user_id, "could not deliver the auction-finished notice"),
            }
        }
        self.lobby.detach(self.product_id);
        self.metrics.increment_rooms_closed();
        self.done.cancel();
        notified
    }
}

enum Closing {
    DeadlineElapsed,
    Cancelled,
}

pub(crate) enum Summary {
    DeadlineElapsed { clients_notified: usize },
    Cancelled { clients_notified: usize },
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Summary::DeadlineElapsed {
                clients_notified,
            } => write!(
                f,
                "auction deadline elapsed; notified {clients_notified} bidders"
            ),
            Summary::Cancelled {
                clients_notified,
            } => write!(f, "auction was cancelled; notified {clients_notified} bidders"),
        }
    }
}
