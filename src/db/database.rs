use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{TxReason, UserRow};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        create_schema(&pool).await?;
        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    /// Single-connection in-memory database for tests. SQLite gives every
    /// connection its own `:memory:` instance, so the pool is capped at one.
    #[cfg(test)]
    pub async fn init_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        create_schema(&pool).await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Looks a user up by Telegram id, creating the row on first contact.
    /// New users receive `signup_credits` starting credits, recorded in the
    /// ledger so the balance invariant holds from the first transaction.
    pub async fn get_or_create_user(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        signup_credits: i64,
    ) -> Result<UserRow> {
        let existing = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE telegram_id = ?",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(user) = existing {
            sqlx::query(
                "UPDATE users SET username = ?, first_name = ?, updated_at = ? WHERE id = ?",
            )
            .bind(username)
            .bind(first_name)
            .bind(Utc::now())
            .bind(user.id)
            .execute(&self.pool)
            .await?;
            return Ok(UserRow {
                username: username.map(|value| value.to_string()),
                first_name: first_name.map(|value| value.to_string()),
                ..user
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO users (telegram_id, username, first_name, credits, total_processed, \
             referral_rewarded, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(telegram_id)
        .bind(username)
        .bind(first_name)
        .bind(signup_credits.max(0))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let user_id = result.last_insert_rowid();

        if signup_credits > 0 {
            sqlx::query(
                "INSERT INTO credit_transactions (user_id, amount, reason, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(signup_credits)
            .bind(TxReason::SignupCredit)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!("Created user {user_id} for telegram id {telegram_id}");

        let user = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn mark_processed(&self, user_id: i64, count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE users SET total_processed = total_processed + ?, updated_at = ? WHERE id = ?",
        )
        .bind(count)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        let (users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let (jobs_succeeded,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM generation_jobs WHERE status = 'succeeded'")
                .fetch_one(&self.pool)
                .await?;
        let (jobs_failed,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM generation_jobs WHERE status = 'failed'")
                .fetch_one(&self.pool)
                .await?;
        let (paid_sessions, revenue_rub): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount_rub), 0) FROM payment_sessions WHERE status = 'paid'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(Statistics {
            users,
            jobs_succeeded,
            jobs_failed,
            paid_sessions,
            revenue_rub,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub users: i64,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
    pub paid_sessions: i64,
    pub revenue_rub: i64,
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            telegram_id INTEGER NOT NULL UNIQUE,\
            username TEXT,\
            first_name TEXT,\
            credits INTEGER NOT NULL DEFAULT 0,\
            total_processed INTEGER NOT NULL DEFAULT 0,\
            referral_code TEXT UNIQUE,\
            referred_by INTEGER REFERENCES users(id),\
            referral_rewarded INTEGER NOT NULL DEFAULT 0,\
            created_at TEXT NOT NULL,\
            updated_at TEXT NOT NULL\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS credit_transactions (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            user_id INTEGER NOT NULL REFERENCES users(id),\
            amount INTEGER NOT NULL,\
            reason TEXT NOT NULL,\
            created_at TEXT NOT NULL\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS batches (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            album_id TEXT UNIQUE,\
            chat_id INTEGER NOT NULL,\
            user_id INTEGER NOT NULL REFERENCES users(id),\
            declared_size INTEGER,\
            status TEXT NOT NULL DEFAULT 'collecting',\
            created_at TEXT NOT NULL,\
            released_at TEXT,\
            completed_at TEXT\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS generation_jobs (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            batch_id INTEGER NOT NULL REFERENCES batches(id),\
            input_file_id TEXT NOT NULL,\
            output_file_id TEXT,\
            status TEXT NOT NULL DEFAULT 'pending',\
            reserved_credits INTEGER NOT NULL DEFAULT 0,\
            error TEXT,\
            created_at TEXT NOT NULL,\
            updated_at TEXT NOT NULL\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS payment_sessions (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            user_id INTEGER NOT NULL REFERENCES users(id),\
            session_id TEXT NOT NULL UNIQUE,\
            package_name TEXT NOT NULL,\
            credits INTEGER NOT NULL,\
            amount_rub INTEGER NOT NULL,\
            status TEXT NOT NULL DEFAULT 'created',\
            created_at TEXT NOT NULL,\
            paid_at TEXT\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_credit_transactions_user_id \
         ON credit_transactions(user_id);",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generation_jobs_batch_id ON generation_jobs(batch_id);",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_payment_sessions_status ON payment_sessions(status);",
    )
    .execute(pool)
    .await?;

    Ok(())
}
