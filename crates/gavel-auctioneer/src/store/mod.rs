//! The transactional persistence boundary for products and bids.
//!
//! The auction engine never touches durable state directly; everything goes
//! through [`BidStore`]. The shipped implementation is [`in_memory`], but any
//! backend providing the stated isolation and errors is conformant.

use async_trait::async_trait;
use gavel_core::{
    auction::{
        Bid,
        NewProduct,
        Product,
    },
    primitive::{
        Money,
        ProductId,
        UserId,
    },
};

pub mod in_memory;

pub use in_memory::InMemoryStore;

/// The only collaborator permitted to mutate durable auction state.
#[async_trait]
pub trait BidStore: Send + Sync + 'static {
    /// Persists a new product row and returns it with its assigned id.
    async fn create_product(&self, product: NewProduct) -> Result<Product, CreateProductError>;

    async fn get_product(&self, id: ProductId) -> Result<Product, GetProductError>;

    /// Validates and appends one bid.
    ///
    /// Runs as one serialized transaction: between reading the current
    /// ceiling and inserting the new row, no interleaving insert for the
    /// same product may be accepted. A bid is accepted iff its amount
    /// strictly exceeds the current ceiling (the highest accepted bid, or
    /// the product's base price if there is none); a bid exactly equal to
    /// the ceiling is rejected.
    async fn place_bid(
        &self,
        product_id: ProductId,
        bidder: UserId,
        amount: Money,
    ) -> Result<Bid, PlaceBidError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PlaceBidError {
    #[error("bid amount is too low")]
    BidTooLow,
    #[error("product not found")]
    ProductNotFound,
    #[error("the bid store is unavailable")]
    Transient {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GetProductError {
    #[error("product not found")]
    NotFound,
    #[error("the bid store is unavailable")]
    Transient {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CreateProductError {
    #[error("the bid store is unavailable")]
    Transient {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
