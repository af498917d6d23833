/// Core error type for the concierge bot.
///
/// Adapter crates should map their specific errors into this type so the bot
/// core can tell throttling/cancellation apart from transport failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("counter store error: {0}")]
    Store(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True for the two context-termination variants.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
