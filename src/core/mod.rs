//! Protocol primitives shared by every command.
//!
//! Nothing in here knows about claims or receipts; those live in [`crate::plugins`] and
//! are built on the event log and history abstractions defined here.

pub mod config;
pub mod error;
pub mod event;
pub mod event_log;
pub mod history;
pub mod output;
pub mod time;
pub mod workspace;
