use std::error::Error;
use std::time::Duration;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::FileId;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

mod batch;
mod config;
mod db;
mod error;
mod handlers;
mod ledger;
mod orchestrator;
mod payments;
mod referral;
mod services;
mod state;
mod utils;

use batch::{BatchPolicy, BatchTracker, ReleasedBatch};
use config::CONFIG;
use db::database::Database;
use error::{BotError, BotResult};
use handlers::callbacks::{BUY_CALLBACK_PREFIX, PAID_CALLBACK_PREFIX};
use handlers::{callbacks, commands, photos};
use orchestrator::Delivery;
use referral::ReferralPolicy;
use state::AppState;
use utils::logging::init_logging;
use utils::telegram::{get_file_url, send_message_with_retry, send_photo_with_retry};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start(String),
    Help,
    Balance,
    Buy,
    Referral,
    Stats,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!("Starting PassportPhotoBot");

    let db = Database::init(&CONFIG.database_url).await?;
    db.health_check().await?;
    let abandoned = batch::abandon_unfinished(&db).await?;
    if abandoned > 0 {
        warn!("Recovered from restart: {abandoned} unfinished batch(es) abandoned");
    }

    let (tracker, released_rx) = BatchTracker::new(db.clone(), BatchPolicy::from_config());
    let state = AppState::new(db.clone(), tracker, ReferralPolicy::from_config());

    tokio::spawn(run_batch_worker(bot.clone(), db.clone(), released_rx));
    tokio::spawn(run_payment_poller(db.clone(), state.referral));

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .endpoint(handle_message);

    let callback_state = state.clone();
    let callback_handler =
        Update::filter_callback_query().endpoint(move |bot: Bot, query: CallbackQuery| {
            let state = callback_state.clone();
            async move { handle_callback_query(bot, state, query).await }
        });

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start(payload) => {
            let payload = if payload.trim().is_empty() {
                None
            } else {
                Some(payload)
            };
            commands::start_handler(bot, state, message, payload).await?;
        }
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Balance => commands::balance_handler(bot, state, message).await?,
        Command::Buy => commands::buy_handler(bot, message).await?,
        Command::Referral => commands::referral_handler(bot, state, message).await?,
        Command::Stats => commands::stats_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    let chat_id = message.chat.id;
    let message_id = message.id;
    if let Err(err) = photos::handle_inbound(bot.clone(), state, message).await {
        error!("message handling failed: {err}");
        let _ = send_message_with_retry(
            &bot,
            chat_id,
            "Something went wrong while handling your message, please try again.",
            Some(message_id),
        )
        .await;
    }
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    if data.starts_with(BUY_CALLBACK_PREFIX) {
        let bot = bot.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = callbacks::package_selected(bot, state, query).await {
                error!("package selection callback failed: {err}");
            }
        });
        return Ok(());
    }
    if data.starts_with(PAID_CALLBACK_PREFIX) {
        let bot = bot.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = callbacks::payment_check(bot, state, query).await {
                error!("payment check callback failed: {err}");
            }
        });
    }
    Ok(())
}

/// Consumes released batches and runs each one through the pipeline in its
/// own task. Generation downloads the portrait, calls the image service and
/// sends the result; failure notices go out per photo.
async fn run_batch_worker(
    bot: Bot,
    db: Database,
    mut released_rx: tokio::sync::mpsc::Receiver<ReleasedBatch>,
) {
    while let Some(released) = released_rx.recv().await {
        let bot = bot.clone();
        let db = db.clone();
        tokio::spawn(async move {
            let chat_id = ChatId(released.chat_id);

            let gen_bot = bot.clone();
            let generate = move |input_file_id: String| {
                let bot = gen_bot.clone();
                async move { generate_and_send(&bot, chat_id, input_file_id).await }
            };

            let deliver_bot = bot.clone();
            let deliver = move |delivery: Delivery| {
                let bot = deliver_bot.clone();
                async move {
                    match delivery {
                        Delivery::Photo { job_id, .. } => {
                            debug!("Job {job_id} delivered");
                        }
                        Delivery::Failure { job_id, message } => {
                            debug!("Job {job_id} failed, notifying user");
                            if let Err(err) =
                                send_message_with_retry(&bot, chat_id, &message, None).await
                            {
                                warn!("Failed to send failure notice for job {job_id}: {err}");
                            }
                        }
                    }
                }
            };

            match orchestrator::process_released_batch(&db, &released, generate, deliver).await {
                Ok(status) => debug!("Batch {} finished as {status:?}", released.batch_id),
                Err(BotError::BatchAlreadyClaimed(batch_id)) => {
                    debug!("Batch {batch_id} was claimed elsewhere");
                }
                Err(err) => error!("Batch {} processing failed: {err}", released.batch_id),
            }
        });
    }
}

/// One photo end to end: fetch from Telegram, generate, send back. Returns
/// the file id Telegram assigned to the delivered photo.
async fn generate_and_send(bot: &Bot, chat_id: ChatId, input_file_id: String) -> BotResult<String> {
    let url = get_file_url(bot, &FileId(input_file_id)).await?;
    let input = utils::media::download_media(&url)
        .await
        .ok_or_else(|| BotError::ServiceError {
            message: "failed to download the photo from Telegram".to_string(),
            retryable: true,
        })?;
    if !utils::media::is_supported_image(&input) {
        return Err(BotError::ServiceError {
            message: "unsupported image format".to_string(),
            retryable: false,
        });
    }

    let output = services::openrouter::generate_with_retry(&input).await?;
    let sent = send_photo_with_retry(bot, chat_id, &output, None, None).await?;
    let output_file_id = sent
        .photo()
        .and_then(|sizes| sizes.last())
        .map(|photo| photo.file.id.0.clone())
        .unwrap_or_default();
    Ok(output_file_id)
}

/// Safety net behind the "I have paid" button: expires abandoned sessions
/// and reconciles pending ones against the gateway on a fixed interval.
async fn run_payment_poller(db: Database, referral: ReferralPolicy) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(CONFIG.payment_poll_interval_secs.max(5)));
    loop {
        interval.tick().await;

        if let Err(err) = payments::expire_stale_sessions(&db, CONFIG.payment_expiry_minutes).await
        {
            warn!("Session expiry sweep failed: {err}");
        }
        match payments::reconcile_pending(&db, &referral).await {
            Ok(0) => {}
            Ok(count) => info!("Reconciled {count} payment session(s) from the poller"),
            Err(err) => warn!("Payment reconciliation sweep failed: {err}"),
        }
    }
}
