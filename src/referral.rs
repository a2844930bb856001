//! Referral program: every user owns a short invite code, new users are
//! attributed to their inviter exactly once, and the first qualifying
//! purchase pays out both sides exactly once.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::config::CONFIG;
use crate::db::database::Database;
use crate::db::models::{TxReason, UserRow};
use crate::error::BotResult;
use crate::ledger;

const REFERRAL_CODE_LEN: usize = 6;

/// Reward amounts, explicit so the tracker is testable without env config.
#[derive(Debug, Clone, Copy)]
pub struct ReferralPolicy {
    /// Bonus credits for the invited user on their first purchase.
    pub invitee_bonus: i64,
    /// Inviter's share of the purchased credits, in percent (minimum 1
    /// credit once the purchase qualifies).
    pub purchase_percent: i64,
}

impl ReferralPolicy {
    pub fn from_config() -> Self {
        ReferralPolicy {
            invitee_bonus: CONFIG.referral_reward_invitee,
            purchase_percent: CONFIG.referral_reward_purchase_percent,
        }
    }

    pub fn inviter_share(&self, credits_purchased: i64) -> i64 {
        (credits_purchased * self.purchase_percent / 100).max(1)
    }
}

fn random_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LEN)
        .map(|byte| (byte as char).to_ascii_uppercase())
        .collect()
}

/// Returns the user's referral code, generating a collision-checked one on
/// first use.
pub async fn ensure_referral_code(db: &Database, user_id: i64) -> BotResult<String> {
    let existing: Option<(Option<String>,)> =
        sqlx::query_as("SELECT referral_code FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?;
    if let Some((Some(code),)) = existing {
        return Ok(code);
    }

    loop {
        let code = random_code();
        let taken: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM users WHERE referral_code = ?")
                .bind(&code)
                .fetch_optional(db.pool())
                .await?;
        if taken.is_some() {
            continue;
        }
        sqlx::query("UPDATE users SET referral_code = ?, updated_at = ? WHERE id = ?")
            .bind(&code)
            .bind(Utc::now())
            .bind(user_id)
            .execute(db.pool())
            .await?;
        return Ok(code);
    }
}

/// Attributes `invitee` to the owner of `code`. The inviter reference is
/// immutable after the first set; self-referral and repeat attribution are
/// ignored. Returns whether the attribution was recorded.
pub async fn attribute(db: &Database, invitee: &UserRow, code: &str) -> BotResult<bool> {
    let inviter: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE referral_code = ?")
        .bind(code)
        .fetch_optional(db.pool())
        .await?;
    let Some((inviter_id,)) = inviter else {
        return Ok(false);
    };
    if inviter_id == invitee.id {
        return Ok(false);
    }

    let result = sqlx::query(
        "UPDATE users SET referred_by = ?, updated_at = ? WHERE id = ? AND referred_by IS NULL",
    )
    .bind(inviter_id)
    .bind(Utc::now())
    .bind(invitee.id)
    .execute(db.pool())
    .await?;

    if result.rows_affected() > 0 {
        info!("User {} attributed to inviter {inviter_id}", invitee.id);
        return Ok(true);
    }
    Ok(false)
}

/// Pays out both sides of a referral on the invitee's first qualifying
/// purchase. Runs on the caller's connection so the rewards commit together
/// with the payment that triggered them. The `referral_rewarded` flag is
/// flipped with a guard, so a second qualifying event never double-credits.
pub async fn grant_purchase_rewards(
    conn: &mut sqlx::SqliteConnection,
    purchaser_id: i64,
    credits_purchased: i64,
    policy: &ReferralPolicy,
) -> BotResult<Option<i64>> {
    let row: Option<(Option<i64>, bool)> =
        sqlx::query_as("SELECT referred_by, referral_rewarded FROM users WHERE id = ?")
            .bind(purchaser_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((Some(inviter_id), false)) = row else {
        return Ok(None);
    };

    let result = sqlx::query(
        "UPDATE users SET referral_rewarded = 1, updated_at = ? \
         WHERE id = ? AND referral_rewarded = 0",
    )
    .bind(Utc::now())
    .bind(purchaser_id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let inviter_share = policy.inviter_share(credits_purchased);
    ledger::apply_credit(conn, inviter_id, inviter_share, TxReason::ReferralCredit).await?;
    if policy.invitee_bonus > 0 {
        ledger::apply_credit(conn, purchaser_id, policy.invitee_bonus, TxReason::ReferralCredit)
            .await?;
    }

    info!(
        "Referral rewards granted: inviter {inviter_id} +{inviter_share}, invitee {purchaser_id} +{}",
        policy.invitee_bonus
    );
    Ok(Some(inviter_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReferralPolicy {
        ReferralPolicy {
            invitee_bonus: 3,
            purchase_percent: 10,
        }
    }

    async fn user(db: &Database, telegram_id: i64) -> UserRow {
        db.get_or_create_user(telegram_id, None, None, 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn referral_code_is_stable_and_unique_per_user() {
        let db = Database::init_in_memory().await.unwrap();
        let alice = user(&db, 1).await;
        let bob = user(&db, 2).await;

        let code_a = ensure_referral_code(&db, alice.id).await.unwrap();
        let code_b = ensure_referral_code(&db, bob.id).await.unwrap();
        assert_eq!(code_a.len(), REFERRAL_CODE_LEN);
        assert_ne!(code_a, code_b);
        assert_eq!(ensure_referral_code(&db, alice.id).await.unwrap(), code_a);
    }

    #[tokio::test]
    async fn inviter_is_set_once_and_never_reassigned() {
        let db = Database::init_in_memory().await.unwrap();
        let inviter = user(&db, 1).await;
        let other = user(&db, 2).await;
        let invitee = user(&db, 3).await;

        let code_a = ensure_referral_code(&db, inviter.id).await.unwrap();
        let code_b = ensure_referral_code(&db, other.id).await.unwrap();

        assert!(attribute(&db, &invitee, &code_a).await.unwrap());
        assert!(!attribute(&db, &invitee, &code_b).await.unwrap());

        let stored = db.get_user_by_id(invitee.id).await.unwrap().unwrap();
        assert_eq!(stored.referred_by, Some(inviter.id));
    }

    #[tokio::test]
    async fn self_referral_is_rejected() {
        let db = Database::init_in_memory().await.unwrap();
        let alice = user(&db, 1).await;
        let code = ensure_referral_code(&db, alice.id).await.unwrap();
        assert!(!attribute(&db, &alice, &code).await.unwrap());
    }

    #[tokio::test]
    async fn purchase_rewards_are_granted_exactly_once() {
        let db = Database::init_in_memory().await.unwrap();
        let inviter = user(&db, 1).await;
        let invitee = user(&db, 2).await;
        let code = ensure_referral_code(&db, inviter.id).await.unwrap();
        attribute(&db, &invitee, &code).await.unwrap();

        let mut tx = db.pool().begin().await.unwrap();
        let granted = grant_purchase_rewards(&mut tx, invitee.id, 50, &policy())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(granted, Some(inviter.id));

        // 10% of 50 for the inviter, fixed bonus for the invitee.
        assert_eq!(ledger::balance(&db, inviter.id).await.unwrap(), 5);
        assert_eq!(ledger::balance(&db, invitee.id).await.unwrap(), 3);

        // A second qualifying purchase pays nothing more.
        let mut tx = db.pool().begin().await.unwrap();
        let again = grant_purchase_rewards(&mut tx, invitee.id, 50, &policy())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(again, None);
        assert_eq!(ledger::balance(&db, inviter.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unreferred_purchaser_triggers_no_rewards() {
        let db = Database::init_in_memory().await.unwrap();
        let loner = user(&db, 1).await;

        let mut tx = db.pool().begin().await.unwrap();
        let granted = grant_purchase_rewards(&mut tx, loner.id, 50, &policy())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(granted, None);
    }
}
