use std::sync::Arc;

use teloxide::{
    dispatching::{DefaultKey, Dispatcher},
    dptree,
    prelude::*,
    RequestError,
};

use concierge_core::messaging::port::MessagingPort;

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub messenger: Arc<dyn MessagingPort>,
}

impl AppState {
    pub fn new(messenger: Arc<dyn MessagingPort>) -> Self {
        Self { messenger }
    }
}

/// Long-polling dispatcher for commands and menu callbacks.
///
/// No Ctrl-C handler is installed; the caller stops the dispatcher through
/// its shutdown token.
pub fn build_dispatcher(
    bot: Bot,
    state: Arc<AppState>,
) -> Dispatcher<Bot, RequestError, DefaultKey> {
    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
}

/// Best-effort startup log of the bot identity.
pub async fn log_identity(bot: &Bot) {
    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "telegram bot authorized"),
        Err(e) => tracing::warn!(error = %e, "could not fetch bot identity"),
    }
}
