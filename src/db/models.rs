use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Released,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Paid,
    Canceled,
    Expired,
}

/// Reason attached to every ledger entry. The ledger is append-only; a user's
/// balance always equals the sum of their transaction amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxReason {
    GenerationDebit,
    ReferralCredit,
    PurchaseCredit,
    Refund,
    SignupCredit,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub credits: i64,
    pub total_processed: i64,
    pub referral_code: Option<String>,
    pub referred_by: Option<i64>,
    pub referral_rewarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CreditTransactionRow {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub reason: TxReason,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub album_id: Option<String>,
    pub chat_id: i64,
    pub user_id: i64,
    pub declared_size: Option<i64>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationJobRow {
    pub id: i64,
    pub batch_id: i64,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub status: JobStatus,
    pub reserved_credits: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentSessionRow {
    pub id: i64,
    pub user_id: i64,
    pub session_id: String,
    pub package_name: String,
    pub credits: i64,
    pub amount_rub: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}
