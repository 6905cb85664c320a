//! Infrastructure adapters. Implement ports.
//!
//! Telegram Bot API, push feed, persistence, assistant. Map errors to DomainError.

pub mod assistant;
pub mod persistence;
pub mod push;
pub mod telegram;
