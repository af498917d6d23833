//! Outbound messaging abstractions (Telegram today).

pub mod admitted;
pub mod port;
pub mod types;
