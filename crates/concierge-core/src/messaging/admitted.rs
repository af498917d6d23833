use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    admission::AdmissionController,
    domain::{ChatId, MessageRef},
    messaging::{port::MessagingPort, types::InlineKeyboard},
    Context, Result,
};

/// MessagingPort decorator that passes every outbound call through admission
/// control before touching the network.
///
/// Each call gets its own context derived from the process context, bounded
/// by `send_timeout`, so a shutdown or a stuck quota never blocks a handler
/// forever.
pub struct AdmittedMessenger {
    inner: Arc<dyn MessagingPort>,
    admission: Arc<AdmissionController>,
    ctx: Context,
    send_timeout: Duration,
}

impl AdmittedMessenger {
    pub fn new(
        inner: Arc<dyn MessagingPort>,
        admission: Arc<AdmissionController>,
        ctx: Context,
        send_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            admission,
            ctx,
            send_timeout,
        }
    }

    async fn admitted(&self, chat: Option<ChatId>) -> Result<Context> {
        let ctx = self.ctx.with_timeout(self.send_timeout);
        if let Err(e) = self.admission.admit(&ctx, chat).await {
            tracing::warn!(chat = ?chat, error = %e, "outbound call not admitted");
            return Err(e);
        }
        Ok(ctx)
    }
}

#[async_trait]
impl MessagingPort for AdmittedMessenger {
    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let ctx = self.admitted(Some(chat_id)).await?;
        ctx.run(self.inner.send_inline_keyboard(chat_id, html, keyboard))
            .await
    }

    async fn edit_inline_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        let ctx = self.admitted(Some(msg.chat_id)).await?;
        ctx.run(self.inner.edit_inline_keyboard(msg, html, keyboard))
            .await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // No chat_id available here; global quota only.
        let ctx = self.admitted(None).await?;
        ctx.run(self.inner.answer_callback_query(callback_id, text))
            .await
    }
}
