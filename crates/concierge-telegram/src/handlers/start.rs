use concierge_core::{
    domain::{ChatId, UserId},
    Result,
};

use super::menu::MainMenu;
use crate::router::AppState;

pub const WELCOME_TEXT: &str =
    "👋 Welcome to the concierge bot!\n\nChoose the option you are interested in:";

/// Split `/cmd@botname args` into a lowercase command and the rest.
pub fn parse_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

pub async fn handle_command(
    state: &AppState,
    chat_id: ChatId,
    user: Option<(UserId, Option<String>)>,
    text: &str,
) -> Result<()> {
    let (cmd, _args) = parse_command(text);
    match cmd.as_str() {
        "start" | "menu" => handle_start(state, chat_id, user).await,
        other => {
            tracing::debug!(chat_id = chat_id.0, command = other, "ignoring unknown command");
            Ok(())
        }
    }
}

async fn handle_start(
    state: &AppState,
    chat_id: ChatId,
    user: Option<(UserId, Option<String>)>,
) -> Result<()> {
    let (user_id, username) = match &user {
        Some((id, name)) => (Some(id.0), name.as_deref()),
        None => (None, None),
    };
    tracing::info!(
        chat_id = chat_id.0,
        user_id = ?user_id,
        username = ?username,
        "received start command"
    );

    state
        .messenger
        .send_inline_keyboard(chat_id, WELCOME_TEXT, MainMenu::keyboard())
        .await?;

    tracing::info!(chat_id = chat_id.0, user_id = ?user_id, "start message sent");
    Ok(())
}
