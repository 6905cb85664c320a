//! Assistant adapters. Implement the Assistant port.

pub mod echo;

pub use echo::EchoAssistant;
