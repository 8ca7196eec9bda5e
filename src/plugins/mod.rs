//! Protocol components: each module owns one kind of coordination state.

pub mod announce;
pub mod claims;
pub mod gate;
pub mod identity;
pub mod keys;
pub mod receipts;
