//! Core coordination logic for the concierge Telegram bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the shared
//! counter store live behind ports (traits) implemented in adapter modules or
//! adapter crates.

pub mod admission;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod messaging;
pub mod store;

pub use context::Context;
pub use errors::{Error, Result};
