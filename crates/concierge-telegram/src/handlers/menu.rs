use concierge_core::{
    domain::{MessageRef, UserId},
    messaging::types::{InlineButton, InlineKeyboard},
    Result,
};

use crate::router::AppState;

pub const BACK_TO_MAIN: &str = "back_to_main";

const MAIN_MENU_TEXT: &str = "🏠 <b>Main menu</b>\n\nChoose a section:";

/// One entry of the main menu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Section {
    pub callback_data: &'static str,
    pub label: &'static str,
    pub text: &'static str,
}

const SECTIONS: &[Section] = &[
    Section {
        callback_data: "box_solutions",
        label: "📦 Box solutions",
        text: "📦 <b>Box solutions</b>\n\nReady-made packages we can run for you.",
    },
    Section {
        callback_data: "visit_guide",
        label: "🧭 Visit guide",
        text: "🧭 <b>Visit guide</b>\n\nHow to find us and what to expect on site.",
    },
    Section {
        callback_data: "special_project",
        label: "✨ Special project request",
        text: "✨ <b>Special project request</b>\n\nTell us about your idea and we will get back to you.",
    },
    Section {
        callback_data: "project_examples",
        label: "🗂 Project examples",
        text: "🗂 <b>Project examples</b>\n\nA selection of special projects we have delivered.",
    },
    Section {
        callback_data: "about_us",
        label: "ℹ️ About us",
        text: "ℹ️ <b>About us</b>\n\nWho we are and what we do.",
    },
    Section {
        callback_data: "support",
        label: "💬 Support",
        text: "💬 <b>Support</b>\n\nWrite your question here and an operator will answer.",
    },
];

pub struct MainMenu;

impl MainMenu {
    pub fn find(callback_data: &str) -> Option<&'static Section> {
        SECTIONS.iter().find(|s| s.callback_data == callback_data)
    }

    /// Two buttons per row, in menu order.
    pub fn keyboard() -> InlineKeyboard {
        InlineKeyboard::grid(
            SECTIONS
                .iter()
                .map(|s| InlineButton::callback(s.label, s.callback_data))
                .collect(),
            2,
        )
    }

    fn back_keyboard() -> InlineKeyboard {
        InlineKeyboard::new(vec![vec![InlineButton::callback("⬅️ Back", BACK_TO_MAIN)]])
    }
}

/// Transport-free view of a callback query.
#[derive(Clone, Debug)]
pub struct CallbackInput {
    pub callback_id: String,
    pub user_id: UserId,
    /// Message the pressed button belongs to (absent for inline-mode messages).
    pub message: Option<MessageRef>,
    pub data: String,
}

pub async fn handle_menu_callback(state: &AppState, input: &CallbackInput) -> Result<()> {
    let messenger = &state.messenger;

    let Some(msg) = input.message else {
        return messenger
            .answer_callback_query(&input.callback_id, None)
            .await;
    };

    if input.data == BACK_TO_MAIN {
        messenger
            .edit_inline_keyboard(msg, MAIN_MENU_TEXT, MainMenu::keyboard())
            .await?;
        tracing::info!(
            user_id = input.user_id.0,
            chat_id = msg.chat_id.0,
            "main menu opened"
        );
        return messenger
            .answer_callback_query(&input.callback_id, None)
            .await;
    }

    let Some(section) = MainMenu::find(&input.data) else {
        tracing::error!(
            user_id = input.user_id.0,
            callback_data = %input.data,
            "no handler for callback button"
        );
        return messenger
            .answer_callback_query(&input.callback_id, Some("Unknown option"))
            .await;
    };

    messenger
        .edit_inline_keyboard(msg, section.text, MainMenu::back_keyboard())
        .await?;
    tracing::info!(
        user_id = input.user_id.0,
        chat_id = msg.chat_id.0,
        callback_data = section.callback_data,
        "menu section opened"
    );
    let ack = format!("You pressed {}", section.label);
    messenger
        .answer_callback_query(&input.callback_id, Some(&ack))
        .await
}
