use metrics::{
    counter,
    describe_counter,
    Counter,
};

pub struct Metrics {
    bids_received: Counter,
    bids_accepted: Counter,
    bids_rejected: Counter,
    rooms_opened: Counter,
    rooms_closed: Counter,
    sessions_opened: Counter,
    sessions_evicted: Counter,
}

impl Metrics {
    /// Describes and registers all metrics, leaking the handle collection
    /// for the lifetime of the process.
    #[must_use]
    pub fn register() -> &'static Self {
        describe_counter!(
            BIDS_RECEIVED,
            "the number of place-bid messages received across all auction rooms"
        );
        describe_counter!(
            BIDS_ACCEPTED,
            "the number of bids accepted as a new highest bid"
        );
        describe_counter!(
            BIDS_REJECTED,
            "the number of bids rejected (too low, product missing, or store failure)"
        );
        describe_counter!(ROOMS_OPENED, "the number of auction rooms opened");
        describe_counter!(
            ROOMS_CLOSED,
            "the number of auction rooms that ran their terminal path"
        );
        describe_counter!(
            SESSIONS_OPENED,
            "the number of bidder sessions attached to an auction room"
        );
        describe_counter!(
            SESSIONS_EVICTED,
            "the number of bidder sessions evicted because their send queue was full"
        );

        Box::leak(Box::new(Self {
            bids_received: counter!(BIDS_RECEIVED),
            bids_accepted: counter!(BIDS_ACCEPTED),
            bids_rejected: counter!(BIDS_REJECTED),
            rooms_opened: counter!(ROOMS_OPENED),
            rooms_closed: counter!(ROOMS_CLOSED),
            sessions_opened: counter!(SESSIONS_OPENED),
            sessions_evicted: counter!(SESSIONS_EVICTED),
        }))
    }

    pub(crate) fn increment_bids_received(&self) {
        self.bids_received.increment(1);
    }

    pub(crate) fn increment_bids_accepted(&self) {
        self.bids_accepted.increment(1);
    }

    pub(crate) fn increment_bids_rejected(&self) {
        self.bids_rejected.increment(1);
    }

    pub(crate) fn increment_rooms_opened(&self) {
        self.rooms_opened.increment(1);
    }

    pub(crate) fn increment_rooms_closed(&self) {
        self.rooms_closed.increment(1);
    }

    pub(crate) fn increment_sessions_opened(&self) {
        self.sessions_opened.increment(1);
    }

    pub(crate) fn increment_sessions_evicted(&self) {
        self.sessions_evicted.increment(1);
    }
}

const BIDS_RECEIVED: &str = "gavel_auctioneer_bids_received";
const BIDS_ACCEPTED: &str = "gavel_auctioneer_bids_accepted";
const BIDS_REJECTED: &str = "gavel_auctioneer_bids_rejected";
const ROOMS_OPENED: &str = "gavel_auctioneer_rooms_opened";
const ROOMS_CLOSED: &str = "gavel_auctioneer_rooms_closed";
const SESSIONS_OPENED: &str = "gavel_auctioneer_sessions_opened";
const SESSIONS_EVICTED: &str = "gavel_auctioneer_sessions_evicted";
