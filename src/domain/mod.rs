//! Core domain layer. No external I/O dependencies.
//!
//! Entities and error taxonomy live here. Dependencies flow inward.

pub mod entities;
pub mod errors;

pub use entities::{
    ActionKind, ActionPayload, AttrValue, ChatId, MediaReference, MediaType, OutboundAction,
    Payload, Session, StateTag, Update, UpdateId, UserId,
};
pub use errors::{DomainError, HandlerError};
