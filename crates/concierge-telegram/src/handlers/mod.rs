//! Telegram update handlers.
//!
//! Thin teloxide wrappers extract what the menu logic needs and hand off to
//! transport-free functions that only see the `MessagingPort`. Failures are
//! logged here and never bubble up to the dispatcher: one bad update must not
//! take the bot down.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use concierge_core::domain::{ChatId, MessageId, MessageRef, UserId};

use crate::router::AppState;

mod menu;
mod start;

pub use menu::{handle_menu_callback, CallbackInput, MainMenu, Section, BACK_TO_MAIN};
pub use start::{handle_command, parse_command, WELCOME_TEXT};

pub async fn handle_message(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }

    let chat_id = ChatId(msg.chat.id.0);
    let user = msg.from().map(|u| (UserId(u.id.0 as i64), u.username.clone()));

    if let Err(e) = handle_command(&state, chat_id, user, text).await {
        if e.is_context_error() {
            tracing::warn!(chat_id = chat_id.0, error = %e, "command reply not admitted in time");
        } else {
            tracing::error!(chat_id = chat_id.0, error = %e, "command handling failed");
        }
    }
    Ok(())
}

pub async fn handle_callback(
    _bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let input = CallbackInput {
        callback_id: q.id.clone(),
        user_id: UserId(q.from.id.0 as i64),
        message: q.message.as_ref().map(|m| MessageRef {
            chat_id: ChatId(m.chat.id.0),
            message_id: MessageId(m.id.0),
        }),
        data: q.data.clone().unwrap_or_default(),
    };

    if let Err(e) = handle_menu_callback(&state, &input).await {
        if e.is_context_error() {
            tracing::warn!(
                user_id = input.user_id.0,
                callback_data = %input.data,
                error = %e,
                "callback reply not admitted in time"
            );
            return Ok(());
        }
        tracing::error!(
            user_id = input.user_id.0,
            callback_data = %input.data,
            error = %e,
            "callback handling failed"
        );
    }
    Ok(())
}
