//! Append-only credit ledger. Every balance mutation writes the stored
//! balance and a `credit_transactions` row inside one SQL transaction, so
//! `users.credits == SUM(credit_transactions.amount)` holds at all times.

use chrono::Utc;

use crate::db::database::Database;
use crate::db::models::TxReason;
use crate::error::{BotError, BotResult};

/// Debits `amount` credits, failing with `InsufficientCredits` when the
/// balance is too low. The decrement is guarded by `credits >= ?` in the
/// UPDATE itself, so two concurrent debits can never overdraw one user.
pub async fn debit(db: &Database, user_id: i64, amount: i64) -> BotResult<()> {
    debug_assert!(amount > 0);
    let mut tx = db.pool().begin().await?;

    let result = sqlx::query(
        "UPDATE users SET credits = credits - ?, updated_at = ? WHERE id = ? AND credits >= ?",
    )
    .bind(amount)
    .bind(Utc::now())
    .bind(user_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        let balance: Option<(i64,)> = sqlx::query_as("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.rollback().await?;
        return match balance {
            Some((balance,)) => Err(BotError::InsufficientCredits {
                balance,
                required: amount,
            }),
            None => Err(BotError::UnknownUser(user_id)),
        };
    }

    sqlx::query(
        "INSERT INTO credit_transactions (user_id, amount, reason, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(-amount)
    .bind(TxReason::GenerationDebit)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Credit applied on an existing connection, so callers that must couple the
/// ledger write with another state change (payment reconciliation, referral
/// rewards) can do both inside one transaction.
pub(crate) async fn apply_credit(
    conn: &mut sqlx::SqliteConnection,
    user_id: i64,
    amount: i64,
    reason: TxReason,
) -> BotResult<()> {
    debug_assert!(amount > 0);
    let result = sqlx::query("UPDATE users SET credits = credits + ?, updated_at = ? WHERE id = ?")
        .bind(amount)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(BotError::UnknownUser(user_id));
    }

    sqlx::query(
        "INSERT INTO credit_transactions (user_id, amount, reason, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(amount)
    .bind(reason)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Credits `amount` to the user. Always succeeds for a known user.
pub async fn credit(db: &Database, user_id: i64, amount: i64, reason: TxReason) -> BotResult<()> {
    let mut tx = db.pool().begin().await?;
    apply_credit(&mut tx, user_id, amount, reason).await?;
    tx.commit().await?;
    Ok(())
}

/// Most recent ledger entries for a user, newest first.
pub async fn recent_transactions(
    db: &Database,
    user_id: i64,
    limit: i64,
) -> BotResult<Vec<crate::db::models::CreditTransactionRow>> {
    let rows = sqlx::query_as::<_, crate::db::models::CreditTransactionRow>(
        "SELECT * FROM credit_transactions WHERE user_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(db.pool())
    .await?;
    Ok(rows)
}

/// Credits back a failed reservation with reason `refund`.
pub async fn refund(db: &Database, user_id: i64, amount: i64) -> BotResult<()> {
    credit(db, user_id, amount, TxReason::Refund).await
}

pub async fn balance(db: &Database, user_id: i64) -> BotResult<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT credits FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(db.pool())
        .await?;
    row.map(|(credits,)| credits)
        .ok_or(BotError::UnknownUser(user_id))
}

/// Sum of all ledger entries for the user. Equals `balance` by invariant.
pub async fn transaction_sum(db: &Database, user_id: i64) -> BotResult<i64> {
    let (sum,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(db.pool())
    .await?;
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn user_with_credits(db: &Database, telegram_id: i64, credits: i64) -> i64 {
        db.get_or_create_user(telegram_id, Some("tester"), None, credits)
            .await
            .expect("create user")
            .id
    }

    #[tokio::test]
    async fn debit_fails_when_balance_is_too_low() {
        let db = Database::init_in_memory().await.unwrap();
        let user_id = user_with_credits(&db, 100, 1).await;

        let err = debit(&db, user_id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::InsufficientCredits {
                balance: 1,
                required: 2
            }
        ));
        assert_eq!(balance(&db, user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn balance_always_equals_transaction_sum() {
        let db = Database::init_in_memory().await.unwrap();
        let user_id = user_with_credits(&db, 101, 3).await;

        credit(&db, user_id, 10, TxReason::PurchaseCredit).await.unwrap();
        debit(&db, user_id, 4).await.unwrap();
        refund(&db, user_id, 1).await.unwrap();

        let balance = balance(&db, user_id).await.unwrap();
        let sum = transaction_sum(&db, user_id).await.unwrap();
        assert_eq!(balance, 10);
        assert_eq!(balance, sum);
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let db = Database::init_in_memory().await.unwrap();
        let user_id = user_with_credits(&db, 102, 3).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { debit(&db, user_id, 2).await }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        // Balance 3 can cover exactly one debit of 2.
        assert_eq!(successes, 1);
        assert_eq!(balance(&db, user_id).await.unwrap(), 1);
        assert_eq!(transaction_sum(&db, user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn debit_for_unknown_user_is_rejected() {
        let db = Database::init_in_memory().await.unwrap();
        let err = debit(&db, 9999, 1).await.unwrap_err();
        assert!(matches!(err, BotError::UnknownUser(9999)));
    }

    #[tokio::test]
    async fn signup_grant_is_recorded_in_the_ledger() {
        let db = Database::init_in_memory().await.unwrap();
        let user_id = user_with_credits(&db, 103, 3).await;

        assert_eq!(balance(&db, user_id).await.unwrap(), 3);
        assert_eq!(transaction_sum(&db, user_id).await.unwrap(), 3);
    }
}
