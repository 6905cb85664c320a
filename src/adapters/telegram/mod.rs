//! Telegram adapter. Bot API long-poll feed and message delivery.

pub mod bot_api;
pub mod mapper;

pub use bot_api::TelegramBotApi;
