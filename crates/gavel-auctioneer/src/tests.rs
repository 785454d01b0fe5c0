//! End-to-end scenarios driving full auction rooms over in-process
//! connections.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    SinkExt as _,
    StreamExt as _,
};
use gavel_core::{
    auction::{
        Bid,
        NewProduct,
        Product,
    },
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
use jiff::Timestamp;
use tokio::sync::mpsc;
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{
    lobby::Lobby,
    metrics::Metrics,
    room::{
        self,
        RoomHandle,
    },
    session::{
        self,
        SessionHandle,
        SEND_QUEUE_CAPACITY,
    },
    store::{
        BidStore,
        CreateProductError,
        GetProductError,
        InMemoryStore,
        PlaceBidError,
    },
    transport::{
        Connection,
        Frame,
    },
};

const BASE_PRICE: f64 = 100.0;
const HOUR: Duration = Duration::from_secs(3600);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn money(value: f64) -> Money {
    Money::checked_from(value).unwrap()
}

struct TestAuction {
    store: Arc<InMemoryStore>,
    lobby: Lobby,
    product_id: ProductId,
    room: RoomHandle,
    tasks: TaskTracker,
    metrics: &'static Metrics,
    cancellation_token: CancellationToken,
}

impl TestAuction {
    async fn open(auction_window: Duration) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::open_with_engine_store(store.clone(), store, auction_window).await
    }

    /// Opens an auction whose room talks to `engine_store` while the test
    /// inspects `store` directly.
    async fn open_with_engine_store(
        store: Arc<InMemoryStore>,
        engine_store: Arc<dyn BidStore>,
        auction_window: Duration,
    ) -> Self {
        let product = store
            .create_product(NewProduct {
                seller: UserId::random(),
                product_name: "vintage gavel".into(),
                description: "a mahogany auction gavel".into(),
                base_price: money(BASE_PRICE),
                auction_end: Timestamp::now().checked_add(auction_window).unwrap(),
            })
            .await
            .unwrap();

        let lobby = Lobby::new();
        let tasks = TaskTracker::new();
        let metrics = Metrics::register();
        let cancellation_token = CancellationToken::new();
        let (room, worker) = room::Builder {
            product_id: product.id,
            auction_end: product.auction_end,
            store: engine_store,
            lobby: lobby.clone(),
            metrics,
            cancellation_token: cancellation_token.clone(),
        }
        .build();
        lobby.attach(room.clone()).unwrap();
        tasks.spawn(worker.run());

        Self {
            store,
            lobby,
            product_id: product.id,
            room,
            tasks,
            metrics,
            cancellation_token,
        }
    }

    async fn join(&self, user_id: UserId) -> Bidder {
        let (session_end, bidder_end) = Connection::duplex();
        let session = session::spawn(
            user_id,
            session_end,
            self.room.clone(),
            self.metrics,
            &self.tasks,
        );
        self.room.register(session).await.unwrap();
        Bidder {
            user_id,
            connection: bidder_end,
        }
    }
}

struct Bidder {
    user_id: UserId,
    connection: Connection,
}

impl Bidder {
    async fn send_text(&mut self, text: &str) {
        self.connection
            .sink
            .send(Frame::Text(text.into()))
            .await
            .unwrap();
    }

    async fn place_bid(&mut self, amount: f64) {
        let frame = serde_json::to_string(&Message::place_bid(money(amount))).unwrap();
        self.send_text(&frame).await;
    }

    /// The next protocol message, skipping keepalive frames.
    async fn next_message(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.connection.stream.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed while waiting for a message")
                .expect("transport failed");
            match frame {
                Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Close => panic!("connection closed while waiting for a message"),
            }
        }
    }

    /// Asserts that nothing but keepalive traffic arrives for a while.
    async fn assert_silent(&mut self) {
        let received = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match self.connection.stream.next().await {
                    Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                    other => break other,
                }
            }
        })
        .await;
        assert!(received.is_err(), "expected silence, got {received:?}");
    }

    /// Waits for the server side to close the connection.
    async fn expect_closed(&mut self) {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.connection.stream.next())
                .await
                .expect("timed out waiting for the connection to close")
            {
                None | Some(Ok(Frame::Close)) | Some(Err(_)) => return,
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                Some(Ok(Frame::Text(text))) => panic!("expected a close, got text `{text}`"),
            }
        }
    }
}

#[tokio::test]
async fn single_bidder_above_the_base_price_gets_a_confirmation() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    bidder.place_bid(150.0).await;

    let confirmation = bidder.next_message().await;
    assert_eq!(confirmation.kind, MessageKind::SuccessfullyPlacedBid);
    assert_eq!(confirmation.amount, Some(money(150.0)));
    assert_eq!(confirmation.user_id, Some(bidder.user_id));
    bidder.assert_silent().await;

    let bids = auction.store.bids(auction.product_id).await;
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].bidder, bidder.user_id);
    assert_eq!(bids[0].amount, money(150.0));
}

#[tokio::test]
async fn a_bid_at_the_base_price_is_rejected() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    bidder.place_bid(BASE_PRICE).await;

    let rejection = bidder.next_message().await;
    assert_eq!(rejection.kind, MessageKind::FailedToPlaceBid);
    assert_eq!(rejection.message.as_deref(), Some("bid amount is too low"));
    assert!(auction.store.bids(auction.product_id).await.is_empty());
}

#[tokio::test]
async fn two_bidders_observe_each_others_bids_in_order() {
    let auction = TestAuction::open(HOUR).await;
    let mut first = auction.join(UserId::random()).await;
    let mut second = auction.join(UserId::random()).await;

    first.place_bid(150.0).await;
    let confirmation = first.next_message().await;
    assert_eq!(confirmation.kind, MessageKind::SuccessfullyPlacedBid);
    assert_eq!(confirmation.amount, Some(money(150.0)));

    let fan_out = second.next_message().await;
    assert_eq!(fan_out.kind, MessageKind::NewBidPlaced);
    assert_eq!(fan_out.amount, Some(money(150.0)));
    assert_eq!(fan_out.user_id, Some(first.user_id));

    // A stale second bid at the current ceiling.
    second.place_bid(150.0).await;
    assert_eq!(
        second.next_message().await.kind,
        MessageKind::FailedToPlaceBid
    );

    second.place_bid(151.0).await;
    let confirmation = second.next_message().await;
    assert_eq!(confirmation.kind, MessageKind::SuccessfullyPlacedBid);
    assert_eq!(confirmation.amount, Some(money(151.0)));

    let fan_out = first.next_message().await;
    assert_eq!(fan_out.kind, MessageKind::NewBidPlaced);
    assert_eq!(fan_out.amount, Some(money(151.0)));
    assert_eq!(fan_out.user_id, Some(second.user_id));

    let amounts: Vec<_> = auction
        .store
        .bids(auction.product_id)
        .await
        .into_iter()
        .map(|bid| bid.amount)
        .collect();
    assert_eq!(amounts, vec![money(150.0), money(151.0)]);
}

#[tokio::test]
async fn deadline_expiry_notifies_every_bidder_and_detaches_the_room() {
    let auction = TestAuction::open(Duration::from_millis(50)).await;
    let mut first = auction.join(UserId::random()).await;
    let mut second = auction.join(UserId::random()).await;

    assert_eq!(first.next_message().await.kind, MessageKind::AuctionFinished);
    assert_eq!(
        second.next_message().await.kind,
        MessageKind::AuctionFinished
    );
    first.expect_closed().await;
    second.expect_closed().await;

    tokio::time::timeout(RECV_TIMEOUT, auction.room.closed())
        .await
        .unwrap();
    assert!(auction.lobby.lookup(auction.product_id).is_none());
}

#[tokio::test]
async fn a_closed_room_no_longer_accepts_events() {
    let auction = TestAuction::open(Duration::from_millis(20)).await;
    tokio::time::timeout(RECV_TIMEOUT, auction.room.closed())
        .await
        .unwrap();

    let result = auction
        .room
        .broadcast(UserId::random(), Message::place_bid(money(150.0)))
        .await;
    assert!(result.is_err());
    assert!(auction.store.bids(auction.product_id).await.is_empty());
}

#[tokio::test]
async fn cancelling_a_room_finishes_the_auction_early() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    auction.cancellation_token.cancel();

    assert_eq!(
        bidder.next_message().await.kind,
        MessageKind::AuctionFinished
    );
    tokio::time::timeout(RECV_TIMEOUT, auction.room.closed())
        .await
        .unwrap();
    assert!(auction.lobby.lookup(auction.product_id).is_none());
}

#[tokio::test]
async fn malformed_frames_get_an_invalid_json_notice() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    bidder.send_text("not json").await;

    let notice = bidder.next_message().await;
    assert_eq!(notice.kind, MessageKind::InvalidJson);
    assert!(auction.store.bids(auction.product_id).await.is_empty());

    // The room is still open and the session still works.
    bidder.place_bid(150.0).await;
    assert_eq!(
        bidder.next_message().await.kind,
        MessageKind::SuccessfullyPlacedBid
    );
}

#[tokio::test]
async fn oversized_frames_are_treated_as_malformed() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    let oversized = format!(
        r#"{{"kind":0,"amount":150.0,"message":"{}"}}"#,
        "x".repeat(600)
    );
    bidder.send_text(&oversized).await;

    assert_eq!(bidder.next_message().await.kind, MessageKind::InvalidJson);
    assert!(auction.store.bids(auction.product_id).await.is_empty());

    // The limit is enforced by the reader, not the socket: the bidder is
    // answered, not disconnected.
    bidder.place_bid(150.0).await;
    assert_eq!(
        bidder.next_message().await.kind,
        MessageKind::SuccessfullyPlacedBid
    );
}

#[tokio::test]
async fn forged_wire_identities_are_overwritten() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    let forged = UserId::random();
    bidder
        .send_text(&format!(
            r#"{{"kind":0,"amount":150.0,"user_id":"{forged}"}}"#
        ))
        .await;

    let confirmation = bidder.next_message().await;
    assert_eq!(confirmation.kind, MessageKind::SuccessfullyPlacedBid);
    assert_eq!(confirmation.user_id, Some(bidder.user_id));

    let bids = auction.store.bids(auction.product_id).await;
    assert_eq!(bids[0].bidder, bidder.user_id);
}

#[tokio::test]
async fn bids_without_an_amount_are_rejected() {
    let auction = TestAuction::open(HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    bidder.send_text(r#"{"kind":0}"#).await;

    let rejection = bidder.next_message().await;
    assert_eq!(rejection.kind, MessageKind::FailedToPlaceBid);
    assert!(auction.store.bids(auction.product_id).await.is_empty());
}

#[tokio::test]
async fn slow_bidders_are_evicted_once_their_queue_fills() {
    let auction = TestAuction::open(HOUR).await;
    let mut active = auction.join(UserId::random()).await;

    // A session handle whose queue nobody drains stands in for a bidder
    // that stopped reading its socket.
    let slow_user = UserId::random();
    let (queue_tx, mut queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    auction
        .room
        .register(SessionHandle::new(slow_user, queue_tx))
        .await
        .unwrap();

    let total_bids = SEND_QUEUE_CAPACITY + 88;
    for placed in 0..total_bids {
        active.place_bid(BASE_PRICE + 1.0 + placed as f64).await;
        assert_eq!(
            active.next_message().await.kind,
            MessageKind::SuccessfullyPlacedBid
        );
    }

    let bids = auction.store.bids(auction.product_id).await;
    assert_eq!(bids.len(), total_bids);

    // The slow bidder got exactly one queue's worth of fan-out before the
    // room dropped it; dropping its handle also closed the queue.
    let delivered = tokio::time::timeout(RECV_TIMEOUT, async {
        let mut delivered = 0;
        while let Some(message) = queue_rx.recv().await {
            assert_eq!(message.kind, MessageKind::NewBidPlaced);
            delivered += 1;
        }
        delivered
    })
    .await
    .expect("the slow bidder's queue was never closed");
    assert_eq!(delivered, SEND_QUEUE_CAPACITY);
}

#[tokio::test]
async fn a_reconnecting_bidder_replaces_its_earlier_session() {
    let auction = TestAuction::open(HOUR).await;
    let user_id = UserId::random();
    let mut first = auction.join(user_id).await;
    let mut second = auction.join(user_id).await;

    // Registering the second session closed the first one's queue, which
    // winds the first session down and makes it unregister itself.
    first.expect_closed().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The stale unregister must not have evicted the replacement.
    second.place_bid(150.0).await;
    assert_eq!(
        second.next_message().await.kind,
        MessageKind::SuccessfullyPlacedBid
    );
}

#[tokio::test]
async fn transient_store_failures_reject_the_bid_and_keep_the_room_alive() {
    let store = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyStore {
        inner: store.clone(),
        fail_next: AtomicBool::new(true),
    });
    let auction = TestAuction::open_with_engine_store(store, flaky, HOUR).await;
    let mut bidder = auction.join(UserId::random()).await;

    bidder.place_bid(150.0).await;
    let rejection = bidder.next_message().await;
    assert_eq!(rejection.kind, MessageKind::FailedToPlaceBid);
    assert!(auction.store.bids(auction.product_id).await.is_empty());

    // The bid is retriable once the store recovers.
    bidder.place_bid(150.0).await;
    assert_eq!(
        bidder.next_message().await.kind,
        MessageKind::SuccessfullyPlacedBid
    );
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_pinged_and_reaped_on_silence() {
    let tasks = TaskTracker::new();
    let metrics = Metrics::register();
    let (session_end, mut bidder_end) = Connection::duplex();
    let room = RoomHandle::dangling(ProductId::random());
    let _handle = session::spawn(UserId::random(), session_end, room, metrics, &tasks);

    // The writer pings before the read deadline would reap the peer.
    let frame = bidder_end.stream.next().await.unwrap().unwrap();
    assert!(matches!(frame, Frame::Ping(_)));

    // With nothing answering, the reader gives up at its deadline and the
    // session closes the transport.
    loop {
        match bidder_end.stream.next().await {
            None => break,
            Some(Ok(Frame::Ping(_))) => {}
            Some(other) => panic!("unexpected frame while waiting for the close: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_a_quiet_session_alive_past_the_read_deadline() {
    let auction = TestAuction::open(Duration::from_secs(24 * 60 * 60)).await;
    let mut bidder = auction.join(UserId::random()).await;

    // Stay otherwise silent for 150 s, well past the 60 s read deadline.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(50)).await;
        bidder
            .connection
            .sink
            .send(Frame::Pong(Vec::new()))
            .await
            .unwrap();
    }

    bidder.place_bid(150.0).await;
    assert_eq!(
        bidder.next_message().await.kind,
        MessageKind::SuccessfullyPlacedBid
    );
}

/// Delegates to an [`InMemoryStore`] but fails the next `place_bid` with a
/// transient error.
struct FlakyStore {
    inner: Arc<InMemoryStore>,
    fail_next: AtomicBool,
}

#[async_trait]
impl BidStore for FlakyStore {
    async fn create_product(&self, product: NewProduct) -> Result<Product, CreateProductError> {
        self.inner.create_product(product).await
    }

    async fn get_product(&self, id: ProductId) -> Result<Product, GetProductError> {
        self.inner.get_product(id).await
    }

    async fn place_bid(
        &self,
        product_id: ProductId,
        bidder: UserId,
        amount: Money,
    ) -> Result<Bid, PlaceBidError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlaceBidError::Transient {
                source: "the database is down".into(),
            });
        }
        self.inner.place_bid(product_id, bidder, amount).await
    }
}
