//! Port traits. API boundaries for the hexagon.
//!
//! - Inbound: event feeds and the handler plug-in seam
//! - Outbound: called by the engine into infrastructure

pub mod handler;
pub mod inbound;
pub mod outbound;

pub use handler::{Handler, HandlerOutput};
pub use inbound::{FeedBatch, UpdateFeed};
pub use outbound::{
    Assistant, CredentialStore, InFlightCheck, Messenger, SendOutcome, SessionStore,
    WatermarkStore,
};
