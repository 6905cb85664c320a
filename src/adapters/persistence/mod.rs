//! Persistence adapters. Session, credential and watermark stores.

pub mod memory;
pub mod sqlite_credentials;
pub mod watermark_json;

pub use memory::{InMemoryCredentialStore, InMemorySessionStore};
pub use sqlite_credentials::SqliteCredentialStore;
pub use watermark_json::JsonWatermarkStore;
