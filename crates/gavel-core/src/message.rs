//! The JSON message schema spoken between bidders and auction rooms.
//!
//! Every frame in both directions is one [`Message`]:
//!
//! ```json
//! { "kind": <int>, "message": <string?>, "amount": <number?>, "user_id": <uuid?> }
//! ```
//!
//! Absent optional fields are omitted from the encoded form. The server
//! never trusts the inbound `user_id`; the session overwrites it with the
//! authenticated identity before the room sees the message.

use serde::{
    Deserialize,
    Serialize,
};

use crate::primitive::{
    Money,
    UserId,
};

/// Discriminates the message payload. Encoded as a bare integer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    /// Inbound: a bidder submits `amount`.
    PlaceBid = 0,
    /// Outbound: confirmation to the sender of an accepted bid.
    SuccessfullyPlacedBid = 1,
    /// Outbound: rejection to the sender, with a reason.
    FailedToPlaceBid = 2,
    /// Outbound: the previous frame was not parseable.
    InvalidJson = 3,
    /// Outbound: fan-out to every peer except the bidder.
    NewBidPlaced = 4,
    /// Outbound: terminal notice; the server closes afterwards.
    AuctionFinished = 5,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::PlaceBid => 0,
            MessageKind::SuccessfullyPlacedBid => 1,
            MessageKind::FailedToPlaceBid => 2,
            MessageKind::InvalidJson => 3,
            MessageKind::NewBidPlaced => 4,
            MessageKind::AuctionFinished => 5,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PlaceBid),
            1 => Ok(Self::SuccessfullyPlacedBid),
            2 => Ok(Self::FailedToPlaceBid),
            3 => Ok(Self::InvalidJson),
            4 => Ok(Self::NewBidPlaced),
            5 => Ok(Self::AuctionFinished),
            other => Err(UnknownMessageKind(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message kind `{0}`")]
pub struct UnknownMessageKind(u8);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Message {
    #[must_use]
    pub fn place_bid(amount: Money) -> Self {
        Self {
            kind: MessageKind::PlaceBid,
            message: None,
            amount: Some(amount),
            user_id: None,
        }
    }

    #[must_use]
    pub fn successfully_placed_bid(amount: Money, bidder: UserId) -> Self {
        Self {
            kind: MessageKind::SuccessfullyPlacedBid,
            message: Some("your bid was placed with success".into()),
            amount: Some(amount),
            user_id: Some(bidder),
        }
    }

    #[must_use]
    pub fn failed_to_place_bid(reason: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::FailedToPlaceBid,
            message: Some(reason.into()),
            amount: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn invalid_json() -> Self {
        Self {
            kind: MessageKind::InvalidJson,
            message: Some("this message should be a valid json".into()),
            amount: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn new_bid_placed(amount: Money, bidder: UserId) -> Self {
        Self {
            kind: MessageKind::NewBidPlaced,
            message: Some("a new bid was placed".into()),
            amount: Some(amount),
            user_id: Some(bidder),
        }
    }

    #[must_use]
    pub fn auction_finished() -> Self {
        Self {
            kind: MessageKind::AuctionFinished,
            message: Some("the auction has ended, thank you for participating".into()),
            amount: None,
            user_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Message,
        MessageKind,
    };
    use crate::primitive::{
        Money,
        UserId,
    };

    fn money(value: f64) -> Money {
        Money::checked_from(value).unwrap()
    }

    #[test]
    fn every_kind_round_trips_through_json() {
        let bidder = UserId::random();
        let messages = [
            Message::place_bid(money(150.0)),
            Message::successfully_placed_bid(money(150.0), bidder),
            Message::failed_to_place_bid("bid amount is too low"),
            Message::invalid_json(),
            Message::new_bid_placed(money(151.0), bidder),
            Message::auction_finished(),
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: Message = serde_json::from_str(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn kind_is_encoded_as_a_bare_integer() {
        let encoded = serde_json::to_value(Message::auction_finished()).unwrap();
        assert_eq!(encoded["kind"], serde_json::json!(5));
    }

    #[test]
    fn absent_fields_are_omitted() {
        let encoded = serde_json::to_value(Message::place_bid(money(1.0))).unwrap();
        let object = encoded.as_object().unwrap();
        assert!(!object.contains_key("message"));
        assert!(!object.contains_key("user_id"));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"kind":6}"#);
        assert!(result.is_err());
    }

    #[test]
    fn wire_user_id_is_decoded_but_carries_no_authority() {
        // The schema accepts a user_id on any frame; discarding forged
        // identities is the session's job and is tested there.
        let decoded: Message = serde_json::from_str(
            r#"{"kind":0,"amount":42.0,"user_id":"00000000-0000-0000-0000-000000000001"}"#,
        )
        .unwrap();
        assert_eq!(decoded.kind, MessageKind::PlaceBid);
        assert!(decoded.user_id.is_some());
    }
}
