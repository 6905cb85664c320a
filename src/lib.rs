//! tg-lanes: Telegram bot engine with per-chat ordered lanes and optimistic session state.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
