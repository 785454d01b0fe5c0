//! Domain and wire types shared by the gavel auction services.
//!
//! This crate is deliberately small: identifier and money primitives,
//! read-only views of the persisted product and bid rows, and the JSON
//! message schema spoken between bidders and their auction rooms. All
//! live-auction behavior lives in the service crates.

pub mod auction;
pub mod message;
pub mod primitive;
