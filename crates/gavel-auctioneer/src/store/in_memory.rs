//! The in-memory storage of products and bids.

use std::collections::HashMap;

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
use jiff::Timestamp;
use tokio::sync::Mutex;

use super::{
    BidStore,
    CreateProductError,
    GetProductError,
    PlaceBidError,
};

/// An in-process [`BidStore`] keeping all rows in plain maps.
///
/// A single async mutex spans every operation, so each `place_bid` holds the
/// whole store for its read-then-insert sequence. That gives the serialized
/// isolation the trait demands at whole-store granularity.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    bids: HashMap<ProductId, Vec<Bid>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// All accepted bids for `product_id`, in acceptance order.
    pub async fn bids(&self, product_id: ProductId) -> Vec<Bid> {
        self.tables
            .lock()
            .await
            .bids
            .get(&product_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BidStore for InMemoryStore {
    async fn create_product(&self, product: NewProduct) -> Result<Product, CreateProductError> {
        let NewProduct {
            seller,
            product_name,
            description,
            base_price,
            auction_end,
        } = product;
        let product = Product {
            id: ProductId::random(),
            seller,
            product_name,
            description,
            base_price,
            auction_end,
        };
        let mut tables = self.tables.lock().await;
        tables.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn get_product(&self, id: ProductId) -> Result<Product, GetProductError> {
        self.tables
            .lock()
            .await
            .products
            .get(&id)
            .cloned()
            .ok_or(GetProductError::NotFound)
    }

    async fn place_bid(
        &self,
        product_id: ProductId,
        bidder: UserId,
        amount: Money,
    ) -> Result<Bid, PlaceBidError> {
        // One lock span is one transaction.
        let mut tables = self.tables.lock().await;
        let base_price = tables
            .products
            .get(&product_id)
            .ok_or(PlaceBidError::ProductNotFound)?
            .base_price;
        // Accepted amounts are strictly increasing, so the last row is the
        // ceiling.
        let ceiling = tables
            .bids
            .get(&product_id)
            .and_then(|bids| bids.last())
            .map(|bid| bid.amount);
        let accepted = match ceiling {
            Some(highest) => amount > highest,
            None => amount > base_price,
        };
        if !accepted {
            return Err(PlaceBidError::BidTooLow);
        }
        let bid = Bid {
            product_id,
            bidder,
            amount,
            placed_at: Timestamp::now(),
        };
        tables.bids.entry(product_id).or_default().push(bid.clone());
        Ok(bid)
    }
}
