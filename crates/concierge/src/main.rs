use std::sync::Arc;

use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use concierge_core::{
    admission::AdmissionController,
    config::Config,
    lifecycle::{OsSignals, ShutdownHandler, ShutdownTask},
    messaging::{admitted::AdmittedMessenger, port::MessagingPort},
    store::{CounterStore, MemoryCounterStore, ValkeyCounterStore},
    Context,
};
use concierge_telegram::{
    router::{self, AppState},
    TelegramMessenger,
};

#[tokio::main]
async fn main() -> Result<(), concierge_core::Error> {
    let cfg = Config::load()?;
    concierge_core::logging::init("concierge", cfg.environment, &cfg.log_level)?;

    let root = CancellationToken::new();
    let ctx = Context::new(root.clone());

    let valkey = cfg
        .valkey_url
        .as_deref()
        .map(|url| ValkeyCounterStore::new(url, cfg.valkey_timeout).map(Arc::new))
        .transpose()?;
    let store: Arc<dyn CounterStore> = match &valkey {
        Some(valkey) => {
            tracing::info!(url = %valkey.url(), "window counter shared through valkey");
            valkey.clone()
        }
        None => {
            tracing::info!("VALKEY_URL not set, window counter is process-local");
            Arc::new(MemoryCounterStore::new())
        }
    };
    let admission = Arc::new(AdmissionController::with_store(cfg.admission, store));

    let bot = Bot::new(cfg.telegram_bot_token.clone());
    router::log_identity(&bot).await;

    let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(AdmittedMessenger::new(
        raw,
        admission.clone(),
        ctx.clone(),
        cfg.send_timeout,
    ));
    let state = Arc::new(AppState::new(messenger));
    let mut dispatcher = router::build_dispatcher(bot, state);

    let mut tasks = Vec::new();
    let updates = dispatcher.shutdown_token();
    tasks.push(ShutdownTask::new("telegram-updates", move |ctx| async move {
        match updates.shutdown() {
            Ok(stopped) => {
                ctx.run(async {
                    stopped.await;
                    Ok(())
                })
                .await?
            }
            Err(_) => tracing::debug!("dispatcher was not running"),
        }
        anyhow::Ok(())
    }));
    if let Some(valkey) = valkey {
        tasks.push(ShutdownTask::new("counter-store", move |_ctx| async move {
            valkey.close().await;
            anyhow::Ok(())
        }));
    }

    let signals = OsSignals::new()?;
    let shutdown = {
        let ctx = ctx.clone();
        let root = root.clone();
        let timeout = cfg.shutdown_timeout;
        tokio::spawn(async move {
            let handler = ShutdownHandler::with_timeout(timeout);
            if let Err(e) = handler
                .wait_for_shutdown(&ctx, signals, move || root.cancel(), tasks)
                .await
            {
                tracing::error!(error = %e, "graceful shutdown incomplete");
            }
        })
    };

    tracing::info!("concierge bot started");
    dispatcher.dispatch().await;

    // Polling only stops on shutdown; make sure the handler wakes up either way.
    root.cancel();
    if let Err(e) = shutdown.await {
        tracing::error!(error = %e, "shutdown handler panicked");
    }

    tracing::info!(
        throttled_total = admission.throttled_total(),
        "concierge bot stopped"
    );
    Ok(())
}
