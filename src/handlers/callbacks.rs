use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::warn;

use crate::config::CONFIG;
use crate::error::BotError;
use crate::payments::{self, Reconciliation};
use crate::services::yookassa;
use crate::state::AppState;

pub const BUY_CALLBACK_PREFIX: &str = "buy:";
pub const PAID_CALLBACK_PREFIX: &str = "paid:";

/// User picked a credit package from the /buy keyboard.
pub async fn package_selected(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(package) = data
        .strip_prefix(BUY_CALLBACK_PREFIX)
        .and_then(|index| index.parse::<usize>().ok())
        .and_then(|index| CONFIG.packages.get(index))
    else {
        bot.answer_callback_query(query.id.clone()).await?;
        return Ok(());
    };

    let from = &query.from;
    let user = state
        .db
        .get_or_create_user(
            i64::try_from(from.id.0).unwrap_or_default(),
            from.username.as_deref(),
            Some(&from.first_name),
            CONFIG.free_credits_count,
        )
        .await?;

    let (session, confirmation_url) = payments::create_session(&state.db, &user, package).await?;
    bot.answer_callback_query(query.id.clone()).await?;

    let Some(message) = query.message.as_ref() else {
        return Ok(());
    };
    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::url(
            "Pay now",
            confirmation_url.parse()?,
        )],
        vec![InlineKeyboardButton::callback(
            "I have paid",
            format!("{PAID_CALLBACK_PREFIX}{}", session.session_id),
        )],
    ]);
    bot.send_message(
        message.chat().id,
        format!(
            "{}: {} credits for {} RUB.\nComplete the payment, then press the button below.",
            package.name, package.credits, package.price_rub
        ),
    )
    .reply_markup(keyboard)
    .await?;
    Ok(())
}

/// User pressed "I have paid". We ask the gateway and reconcile locally; a
/// repeated press on an already-credited session is answered politely and
/// never credits twice.
pub async fn payment_check(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let Some(session_id) = query
        .data
        .as_deref()
        .and_then(|data| data.strip_prefix(PAID_CALLBACK_PREFIX))
    else {
        return Ok(());
    };

    bot.answer_callback_query(query.id.clone()).await?;
    let Some(message) = query.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;

    let gateway = match yookassa::fetch_payment_status(session_id).await {
        Ok(status) => status,
        Err(err) => {
            warn!("Gateway status check failed for session {session_id}: {err}");
            bot.send_message(
                chat_id,
                "Could not reach the payment service, please try again in a minute.",
            )
            .await?;
            return Ok(());
        }
    };

    let reply = match payments::apply_confirmation(&state.db, session_id, gateway, &state.referral)
        .await
    {
        Ok(Reconciliation::Credited { credits }) => {
            let session = payments::get_session(&state.db, session_id).await?;
            let balance = crate::ledger::balance(&state.db, session.user_id).await?;
            format!("Payment received! {credits} credit(s) added. Your balance is {balance}.")
        }
        Ok(Reconciliation::Canceled) => {
            "This payment was canceled. Use /buy to start over.".to_string()
        }
        Ok(Reconciliation::NoChange) => {
            "The payment is not confirmed yet. Give it a moment and press the button again."
                .to_string()
        }
        Err(BotError::DuplicateConfirmation(_)) => {
            "This payment was already credited. Check /balance.".to_string()
        }
        Err(err) => {
            warn!("Reconciliation failed for session {session_id}: {err}");
            "Something went wrong while checking the payment. Support has been notified."
                .to_string()
        }
    };
    bot.send_message(chat_id, reply).await?;
    Ok(())
}
