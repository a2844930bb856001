use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::info;

use crate::config::CONFIG;
use crate::db::models::TxReason;
use crate::handlers::callbacks::BUY_CALLBACK_PREFIX;
use crate::ledger;
use crate::referral;
use crate::state::AppState;
use crate::utils::telegram::send_message_with_retry;

const HELP_TEXT: &str = "Send me a portrait photo and I will turn it into a passport photo \
with a white background and correct framing. Albums work too: every photo \
in the album is processed.\n\n\
Each photo costs 1 credit.\n\n\
/balance - your credits and processed photo count\n\
/buy - purchase credit packages\n\
/referral - your invite link (earn credits when friends buy)\n\
/help - this message";

fn reason_label(reason: TxReason) -> &'static str {
    match reason {
        TxReason::GenerationDebit => "photo generation",
        TxReason::ReferralCredit => "referral reward",
        TxReason::PurchaseCredit => "purchase",
        TxReason::Refund => "refund",
        TxReason::SignupCredit => "welcome bonus",
    }
}

pub async fn start_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    payload: Option<String>,
) -> Result<()> {
    let Some(from) = message.from.as_ref() else {
        return Ok(());
    };

    let user = state
        .db
        .get_or_create_user(
            i64::try_from(from.id.0).unwrap_or_default(),
            from.username.as_deref(),
            Some(&from.first_name),
            CONFIG.free_credits_count,
        )
        .await?;

    let mut greeting = format!(
        "Hello, {}! Send me a portrait photo and I will make a passport photo out of it.\n\
         You have {} credit(s). Use /help for details.",
        from.first_name, user.credits
    );

    if let Some(code) = payload.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        if referral::attribute(&state.db, &user, code).await? {
            info!("User {} joined through referral code {code}", user.id);
            greeting.push_str("\n\nYou joined through an invite link - your first purchase \
                               comes with bonus credits for you both!");
        }
    }

    send_message_with_retry(&bot, message.chat.id, &greeting, Some(message.id)).await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    send_message_with_retry(&bot, message.chat.id, HELP_TEXT, Some(message.id)).await?;
    Ok(())
}

pub async fn balance_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(from) = message.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = i64::try_from(from.id.0).unwrap_or_default();

    let Some(user) = state.db.get_user_by_telegram_id(telegram_id).await? else {
        send_message_with_retry(
            &bot,
            message.chat.id,
            "Use /start first so I can set up your account.",
            Some(message.id),
        )
        .await?;
        return Ok(());
    };

    let mut text = format!(
        "Credits: {}\nPhotos processed: {}",
        user.credits, user.total_processed
    );
    let recent = ledger::recent_transactions(&state.db, user.id, 5).await?;
    if !recent.is_empty() {
        text.push_str("\n\nRecent activity:");
        for entry in recent {
            text.push_str(&format!(
                "\n{:+} - {}",
                entry.amount,
                reason_label(entry.reason)
            ));
        }
    }

    send_message_with_retry(&bot, message.chat.id, &text, Some(message.id)).await?;
    Ok(())
}

pub async fn buy_handler(bot: Bot, message: Message) -> Result<()> {
    if CONFIG.packages.is_empty() {
        send_message_with_retry(
            &bot,
            message.chat.id,
            "No credit packages are available right now.",
            Some(message.id),
        )
        .await?;
        return Ok(());
    }

    let rows: Vec<Vec<InlineKeyboardButton>> = CONFIG
        .packages
        .iter()
        .enumerate()
        .map(|(index, package)| {
            vec![InlineKeyboardButton::callback(
                format!(
                    "{} - {} credits for {} RUB",
                    package.name, package.credits, package.price_rub
                ),
                format!("{BUY_CALLBACK_PREFIX}{index}"),
            )]
        })
        .collect();

    bot.send_message(message.chat.id, "Choose a credit package:")
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

pub async fn referral_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(from) = message.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = i64::try_from(from.id.0).unwrap_or_default();

    let user = state
        .db
        .get_or_create_user(
            telegram_id,
            from.username.as_deref(),
            Some(&from.first_name),
            CONFIG.free_credits_count,
        )
        .await?;
    let code = referral::ensure_referral_code(&state.db, user.id).await?;

    let me = bot.get_me().await?;
    let text = format!(
        "Your invite link:\nhttps://t.me/{}?start={code}\n\n\
         When an invited friend makes their first purchase, you receive {}% of the \
         purchased credits and they get {} bonus credit(s).",
        me.username(),
        CONFIG.referral_reward_purchase_percent,
        CONFIG.referral_reward_invitee
    );
    send_message_with_retry(&bot, message.chat.id, &text, Some(message.id)).await?;
    Ok(())
}

pub async fn stats_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(from) = message.from.as_ref() else {
        return Ok(());
    };
    if !CONFIG.is_admin(i64::try_from(from.id.0).unwrap_or_default()) {
        return Ok(());
    }

    let stats = state.db.statistics().await?;
    let text = format!(
        "Users: {}\nPhotos generated: {}\nFailed jobs: {}\nPaid sessions: {}\nRevenue: {} RUB",
        stats.users, stats.jobs_succeeded, stats.jobs_failed, stats.paid_sessions, stats.revenue_rub
    );
    send_message_with_retry(&bot, message.chat.id, &text, Some(message.id)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_reasons_render_as_plain_words() {
        let reasons = [
            TxReason::GenerationDebit,
            TxReason::ReferralCredit,
            TxReason::PurchaseCredit,
            TxReason::Refund,
            TxReason::SignupCredit,
        ];
        for reason in reasons {
            let label = reason_label(reason);
            assert!(
                label
                    .chars()
                    .all(|ch| ch.is_ascii_lowercase() || ch == ' '),
                "label {label:?} leaks an internal identifier"
            );
        }
    }
}
