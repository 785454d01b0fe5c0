//! Read-only views of the rows owned by the persistence boundary.

use jiff::Timestamp;
use serde::{
    Deserialize,
    Serialize,
};

use crate::primitive::{
    Money,
    ProductId,
    UserId,
};

/// A product under auction as persisted by the store.
///
/// The auction engine never mutates products; it only reads the base price
/// and the auction deadline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub seller: UserId,
    pub product_name: String,
    pub description: String,
    pub base_price: Money,
    pub auction_end: Timestamp,
}

/// The input row for creating a product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub seller: UserId,
    pub product_name: String,
    pub description: String,
    pub base_price: Money,
    pub auction_end: Timestamp,
}

/// An accepted bid. Bid rows are appended by the store and never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub product_id: ProductId,
    pub bidder: UserId,
    pub amount: Money,
    pub placed_at: Timestamp,
}
