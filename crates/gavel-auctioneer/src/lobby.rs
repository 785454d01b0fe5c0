//! The process-wide registry of live auction rooms.

use std::sync::Arc;

use gavel_core::primitive::ProductId;

use crate::room::RoomHandle;

/// Maps products to their live auction rooms.
///
/// Cloning is cheap; every clone views the same registry. Rooms are attached
/// by the product-creation edge and detached exactly once by their own
/// terminal path.
#[derive(Clone)]
pub(crate) struct Lobby {
    rooms: Arc<papaya::HashMap<ProductId, RoomHandle>>,
}

impl Lobby {
    pub(crate) fn new() -> Self {
        Self {
            rooms: Arc::new(papaya::HashMap::new()),
        }
    }

    /// Registers a live room under its product id.
    ///
    /// # Errors
    /// Returns an error if a room is already live for the product.
    pub(crate) fn attach(&self, handle: RoomHandle) -> Result<(), AlreadyLive> {
        let product_id = handle.product_id();
        self.rooms
            .pin()
            .try_insert(product_id, handle)
            .map(|_| ())
            .map_err(|_| AlreadyLive(product_id))
    }

    /// A miss means the auction has ended or never existed.
    pub(crate) fn lookup(&self, product_id: ProductId) -> Option<RoomHandle> {
        self.rooms.pin().get(&product_id).cloned()
    }

    pub(crate) fn detach(&self, product_id: ProductId) {
        self.rooms.pin().remove(&product_id);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("an auction room for product `{0}` is already live")]
pub(crate) struct AlreadyLive(ProductId);
