//! Payment bridge: creates YooKassa sessions for credit packages and
//! reconciles their outcomes into the ledger. Reconciliation is idempotent
//! under at-least-once delivery; a duplicate confirmation never
//! double-credits.

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::PackageConfig;
use crate::db::database::Database;
use crate::db::models::{PaymentSessionRow, SessionStatus, TxReason, UserRow};
use crate::error::{BotError, BotResult};
use crate::ledger;
use crate::referral::{self, ReferralPolicy};
use crate::services::yookassa::{self, GatewayStatus};

/// Outcome of applying one gateway confirmation to the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Session moved to `paid` and the ledger was credited.
    Credited { credits: i64 },
    /// Session moved to `canceled`, no ledger effect.
    Canceled,
    /// Gateway still pending, nothing to do yet.
    NoChange,
}

/// Creates a gateway payment and records the local session as `created`.
/// Returns the session row and the URL the user must visit.
pub async fn create_session(
    db: &Database,
    user: &UserRow,
    package: &PackageConfig,
) -> BotResult<(PaymentSessionRow, String)> {
    let description = format!("{} package: {} credits", package.name, package.credits);
    let payment = yookassa::create_payment(package.price_rub, &description, user.telegram_id).await?;

    let session = record_session(
        db,
        user.id,
        &payment.payment_id,
        &package.name,
        package.credits,
        package.price_rub,
    )
    .await?;

    info!(
        "Payment session {} created for user {} ({} credits)",
        session.session_id, user.id, package.credits
    );
    Ok((session, payment.confirmation_url))
}

/// Persists a gateway session locally in status `created`.
pub async fn record_session(
    db: &Database,
    user_id: i64,
    session_id: &str,
    package_name: &str,
    credits: i64,
    amount_rub: i64,
) -> BotResult<PaymentSessionRow> {
    sqlx::query(
        "INSERT INTO payment_sessions (user_id, session_id, package_name, credits, amount_rub, \
         status, created_at) VALUES (?, ?, ?, ?, ?, 'created', ?)",
    )
    .bind(user_id)
    .bind(session_id)
    .bind(package_name)
    .bind(credits)
    .bind(amount_rub)
    .bind(Utc::now())
    .execute(db.pool())
    .await?;

    get_session(db, session_id).await
}

pub async fn get_session(db: &Database, session_id: &str) -> BotResult<PaymentSessionRow> {
    let session = sqlx::query_as::<_, PaymentSessionRow>(
        "SELECT * FROM payment_sessions WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_one(db.pool())
    .await?;
    Ok(session)
}

/// Applies one gateway-reported status to the local session record.
///
/// The `created -> paid` transition is a guarded UPDATE and the ledger
/// credit runs in the same SQL transaction, so a webhook retry or a
/// concurrent poll can confirm a session at most once. A confirmation for a
/// session that is already `paid` comes back as `DuplicateConfirmation`; a
/// status the local record cannot accept is a `PaymentMismatch`.
pub async fn apply_confirmation(
    db: &Database,
    session_id: &str,
    gateway: GatewayStatus,
    referral: &ReferralPolicy,
) -> BotResult<Reconciliation> {
    let session = get_session(db, session_id).await?;

    match (gateway, session.status) {
        (GatewayStatus::Pending, _) => Ok(Reconciliation::NoChange),

        (GatewayStatus::Succeeded, SessionStatus::Created) => {
            let mut tx = db.pool().begin().await?;
            let result = sqlx::query(
                "UPDATE payment_sessions SET status = 'paid', paid_at = ? \
                 WHERE session_id = ? AND status = 'created'",
            )
            .bind(Utc::now())
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(BotError::DuplicateConfirmation(session_id.to_string()));
            }

            ledger::apply_credit(&mut tx, session.user_id, session.credits, TxReason::PurchaseCredit)
                .await?;
            referral::grant_purchase_rewards(&mut tx, session.user_id, session.credits, referral)
                .await?;
            tx.commit().await?;

            info!(
                "Session {} paid: user {} credited {}",
                session_id, session.user_id, session.credits
            );
            Ok(Reconciliation::Credited {
                credits: session.credits,
            })
        }

        (GatewayStatus::Succeeded, SessionStatus::Paid) => {
            Err(BotError::DuplicateConfirmation(session_id.to_string()))
        }

        (GatewayStatus::Canceled, SessionStatus::Created) => {
            sqlx::query(
                "UPDATE payment_sessions SET status = 'canceled' \
                 WHERE session_id = ? AND status = 'created'",
            )
            .bind(session_id)
            .execute(db.pool())
            .await?;
            info!("Session {session_id} canceled by the gateway");
            Ok(Reconciliation::Canceled)
        }

        (GatewayStatus::Canceled, SessionStatus::Canceled)
        | (GatewayStatus::Canceled, SessionStatus::Expired) => Ok(Reconciliation::NoChange),

        (gateway, local) => Err(BotError::PaymentMismatch {
            session_id: session_id.to_string(),
            local: format!("{local:?}").to_lowercase(),
            gateway: format!("{gateway:?}").to_lowercase(),
        }),
    }
}

/// Polls the gateway for every locally pending session. Duplicate
/// confirmations are swallowed here; mismatches are logged and left alone.
pub async fn reconcile_pending(db: &Database, referral: &ReferralPolicy) -> BotResult<usize> {
    let pending = sqlx::query_as::<_, PaymentSessionRow>(
        "SELECT * FROM payment_sessions WHERE status = 'created'",
    )
    .fetch_all(db.pool())
    .await?;

    let mut reconciled = 0;
    for session in pending {
        let gateway = match yookassa::fetch_payment_status(&session.session_id).await {
            Ok(status) => status,
            Err(err) => {
                warn!("Status check for session {} failed: {err}", session.session_id);
                continue;
            }
        };
        match apply_confirmation(db, &session.session_id, gateway, referral).await {
            Ok(Reconciliation::NoChange) => {}
            Ok(_) => reconciled += 1,
            Err(BotError::DuplicateConfirmation(id)) => {
                debug!("Duplicate confirmation for session {id} swallowed");
            }
            Err(BotError::PaymentMismatch {
                session_id,
                local,
                gateway,
            }) => {
                warn!(
                    "Payment mismatch for session {session_id}: local={local}, gateway={gateway}"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(reconciled)
}

/// Expires sessions the user abandoned. No ledger effect.
pub async fn expire_stale_sessions(db: &Database, older_than_minutes: i64) -> BotResult<u64> {
    let cutoff = Utc::now() - Duration::minutes(older_than_minutes);
    let result = sqlx::query(
        "UPDATE payment_sessions SET status = 'expired' \
         WHERE status = 'created' AND created_at < ?",
    )
    .bind(cutoff)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReferralPolicy {
        ReferralPolicy {
            invitee_bonus: 0,
            purchase_percent: 10,
        }
    }

    async fn setup() -> (Database, UserRow) {
        let db = Database::init_in_memory().await.unwrap();
        let user = db.get_or_create_user(42, Some("buyer"), None, 0).await.unwrap();
        (db, user)
    }

    #[tokio::test]
    async fn confirmed_session_credits_the_ledger_once() {
        let (db, user) = setup().await;
        record_session(&db, user.id, "pay-1", "Basic", 10, 180)
            .await
            .unwrap();

        let outcome = apply_confirmation(&db, "pay-1", GatewayStatus::Succeeded, &policy())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Credited { credits: 10 });
        assert_eq!(ledger::balance(&db, user.id).await.unwrap(), 10);

        // Webhook retry: same confirmation again must not double-credit.
        let err = apply_confirmation(&db, "pay-1", GatewayStatus::Succeeded, &policy())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::DuplicateConfirmation(_)));
        assert_eq!(ledger::balance(&db, user.id).await.unwrap(), 10);
        assert_eq!(ledger::transaction_sum(&db, user.id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn cancellation_has_no_ledger_effect() {
        let (db, user) = setup().await;
        record_session(&db, user.id, "pay-2", "Basic", 10, 180)
            .await
            .unwrap();

        let outcome = apply_confirmation(&db, "pay-2", GatewayStatus::Canceled, &policy())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Canceled);
        assert_eq!(ledger::balance(&db, user.id).await.unwrap(), 0);

        let session = get_session(&db, "pay-2").await.unwrap();
        assert_eq!(session.status, SessionStatus::Canceled);
    }

    #[tokio::test]
    async fn success_after_cancellation_is_a_mismatch() {
        let (db, user) = setup().await;
        record_session(&db, user.id, "pay-3", "Basic", 10, 180)
            .await
            .unwrap();
        apply_confirmation(&db, "pay-3", GatewayStatus::Canceled, &policy())
            .await
            .unwrap();

        let err = apply_confirmation(&db, "pay-3", GatewayStatus::Succeeded, &policy())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::PaymentMismatch { .. }));
        assert_eq!(ledger::balance(&db, user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_status_changes_nothing() {
        let (db, user) = setup().await;
        record_session(&db, user.id, "pay-4", "Basic", 10, 180)
            .await
            .unwrap();

        let outcome = apply_confirmation(&db, "pay-4", GatewayStatus::Pending, &policy())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::NoChange);
        let session = get_session(&db, "pay-4").await.unwrap();
        assert_eq!(session.status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn stale_sessions_expire_without_ledger_effect() {
        let (db, user) = setup().await;
        record_session(&db, user.id, "pay-5", "Basic", 10, 180)
            .await
            .unwrap();
        sqlx::query("UPDATE payment_sessions SET created_at = ? WHERE session_id = 'pay-5'")
            .bind(Utc::now() - Duration::minutes(120))
            .execute(db.pool())
            .await
            .unwrap();

        let expired = expire_stale_sessions(&db, 60).await.unwrap();
        assert_eq!(expired, 1);
        let session = get_session(&db, "pay-5").await.unwrap();
        assert_eq!(session.status, SessionStatus::Expired);
        assert_eq!(ledger::balance(&db, user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_purchase_pays_referral_rewards_in_the_same_commit() {
        let (db, invitee) = setup().await;
        let inviter = db.get_or_create_user(43, None, None, 0).await.unwrap();
        let code = crate::referral::ensure_referral_code(&db, inviter.id)
            .await
            .unwrap();
        crate::referral::attribute(&db, &invitee, &code).await.unwrap();

        record_session(&db, invitee.id, "pay-6", "Professional", 50, 750)
            .await
            .unwrap();
        apply_confirmation(&db, "pay-6", GatewayStatus::Succeeded, &policy())
            .await
            .unwrap();

        assert_eq!(ledger::balance(&db, invitee.id).await.unwrap(), 50);
        assert_eq!(ledger::balance(&db, inviter.id).await.unwrap(), 5);
    }
}
