//! Groups photos that arrive together (a Telegram album) into one batch.
//!
//! State machine per batch: `collecting -> released -> processing ->
//! {completed, failed}`. Collection happens in an in-memory pending map;
//! every transition is persisted in the `batches` table, and the
//! `released -> processing` claim is guarded so at most one worker ever
//! processes a batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::db::database::Database;
use crate::db::models::{BatchRow, BatchStatus, GenerationJobRow, JobStatus};
use crate::error::{BotError, BotResult};
use crate::ledger;

/// Release policy, explicit and transport-independent so the tracker can be
/// exercised directly in tests.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    /// Quiet period: release once no new photo arrived for this long.
    pub quiet_period: Duration,
    /// Hard ceiling: release no matter what once this much time passed
    /// since the first photo, so silent albums are never starved.
    pub hard_timeout: Duration,
    /// Cap on photos per batch; reaching it releases immediately.
    pub max_photos: usize,
}

impl BatchPolicy {
    pub fn from_config() -> Self {
        BatchPolicy {
            quiet_period: CONFIG.album_quiet_period(),
            hard_timeout: CONFIG.album_hard_timeout(),
            max_photos: CONFIG.max_batch_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleasedBatch {
    pub batch_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
}

#[derive(Debug)]
struct PendingAlbum {
    batch_id: i64,
    chat_id: i64,
    user_id: i64,
    declared_size: Option<usize>,
    photos: usize,
    first_arrival: Instant,
    last_arrival: Instant,
}

#[derive(Clone)]
pub struct BatchTracker {
    db: Database,
    policy: BatchPolicy,
    pending: Arc<Mutex<HashMap<String, PendingAlbum>>>,
    released_tx: mpsc::Sender<ReleasedBatch>,
}

impl BatchTracker {
    pub fn new(db: Database, policy: BatchPolicy) -> (Self, mpsc::Receiver<ReleasedBatch>) {
        let (released_tx, released_rx) = mpsc::channel(100);
        let tracker = BatchTracker {
            db,
            policy,
            pending: Arc::new(Mutex::new(HashMap::new())),
            released_tx,
        };
        (tracker, released_rx)
    }

    /// Registers one incoming photo. Photos without an album id form a
    /// single-photo batch released immediately; album parts are buffered
    /// until the declared size is reached or a timeout releases them.
    /// `declared_size` is honored when the transport knows it upfront.
    pub async fn add_photo(
        &self,
        chat_id: i64,
        user_id: i64,
        album_id: Option<&str>,
        declared_size: Option<usize>,
        input_file_id: &str,
    ) -> BotResult<i64> {
        let Some(album_id) = album_id else {
            let batch_id = self
                .create_batch(chat_id, user_id, None, Some(1))
                .await?;
            insert_job(&self.db, batch_id, input_file_id).await?;
            self.release(ReleasedBatch {
                batch_id,
                chat_id,
                user_id,
            })
            .await?;
            return Ok(batch_id);
        };

        let batch_id = self
            .create_batch(chat_id, user_id, Some(album_id), declared_size.map(|n| n as i64))
            .await?;

        // A photo can trail in after its album's batch was already released
        // (quiet period elapsed, or the user re-sent a photo much later).
        // The album id maps to a finished batch then; the straggler gets its
        // own immediate batch instead of vanishing into the old one.
        let batch = get_batch(&self.db, batch_id).await?;
        if batch.status != BatchStatus::Collecting {
            debug!(
                "Album {album_id} already maps to {:?} batch {batch_id}; \
                 processing the late photo on its own",
                batch.status
            );
            let fresh = self.create_batch(chat_id, user_id, None, Some(1)).await?;
            insert_job(&self.db, fresh, input_file_id).await?;
            self.release(ReleasedBatch {
                batch_id: fresh,
                chat_id,
                user_id,
            })
            .await?;
            return Ok(fresh);
        }

        insert_job(&self.db, batch_id, input_file_id).await?;

        let (spawn_watcher, release_now) = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            let is_new = !pending.contains_key(album_id);
            let entry = pending
                .entry(album_id.to_string())
                .or_insert_with(|| PendingAlbum {
                    batch_id,
                    chat_id,
                    user_id,
                    declared_size,
                    photos: 0,
                    first_arrival: now,
                    last_arrival: now,
                });
            entry.photos += 1;
            entry.last_arrival = now;
            let full = entry
                .declared_size
                .map(|declared| entry.photos >= declared)
                .unwrap_or(false)
                || entry.photos >= self.policy.max_photos;
            let release_now = if full {
                pending.remove(album_id)
            } else {
                None
            };
            (is_new && release_now.is_none(), release_now)
        };

        if let Some(album) = release_now {
            self.release(ReleasedBatch {
                batch_id: album.batch_id,
                chat_id: album.chat_id,
                user_id: album.user_id,
            })
            .await?;
            return Ok(batch_id);
        }

        if spawn_watcher {
            let tracker = self.clone();
            let album_id = album_id.to_string();
            tokio::spawn(async move {
                tracker.watch_album(album_id).await;
            });
        }

        Ok(batch_id)
    }

    /// Waits out the quiet period for one album and releases whatever
    /// arrived. Re-arms itself while photos keep coming in.
    async fn watch_album(&self, album_id: String) {
        loop {
            let next = {
                let pending = self.pending.lock();
                let Some(entry) = pending.get(&album_id) else {
                    return;
                };
                let quiet_deadline = entry.last_arrival + self.policy.quiet_period;
                let hard_deadline = entry.first_arrival + self.policy.hard_timeout;
                quiet_deadline.min(hard_deadline)
            };

            tokio::time::sleep_until(next).await;

            let expired = {
                let mut pending = self.pending.lock();
                let Some(entry) = pending.get(&album_id) else {
                    return;
                };
                let now = Instant::now();
                let quiet = now >= entry.last_arrival + self.policy.quiet_period;
                let hard = now >= entry.first_arrival + self.policy.hard_timeout;
                if quiet || hard {
                    pending.remove(&album_id)
                } else {
                    None
                }
            };

            if let Some(album) = expired {
                debug!(
                    "Releasing album {album_id} after timeout with {} photo(s)",
                    album.photos
                );
                if let Err(err) = self
                    .release(ReleasedBatch {
                        batch_id: album.batch_id,
                        chat_id: album.chat_id,
                        user_id: album.user_id,
                    })
                    .await
                {
                    warn!("Failed to release batch {}: {err}", album.batch_id);
                }
                return;
            }
        }
    }

    /// Creates the batch row on the first photo of an album. The UNIQUE
    /// constraint on `album_id` makes concurrent first-photo arrivals
    /// converge on one row.
    async fn create_batch(
        &self,
        chat_id: i64,
        user_id: i64,
        album_id: Option<&str>,
        declared_size: Option<i64>,
    ) -> BotResult<i64> {
        if let Some(album_id) = album_id {
            sqlx::query(
                "INSERT INTO batches (album_id, chat_id, user_id, declared_size, status, created_at) \
                 VALUES (?, ?, ?, ?, 'collecting', ?) \
                 ON CONFLICT(album_id) DO NOTHING",
            )
            .bind(album_id)
            .bind(chat_id)
            .bind(user_id)
            .bind(declared_size)
            .bind(Utc::now())
            .execute(self.db.pool())
            .await?;

            let (batch_id,): (i64,) =
                sqlx::query_as("SELECT id FROM batches WHERE album_id = ?")
                    .bind(album_id)
                    .fetch_one(self.db.pool())
                    .await?;
            return Ok(batch_id);
        }

        let result = sqlx::query(
            "INSERT INTO batches (album_id, chat_id, user_id, declared_size, status, created_at) \
             VALUES (NULL, ?, ?, ?, 'collecting', ?)",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(declared_size)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Transitions `collecting -> released` exactly once and hands the batch
    /// to the processing worker. A batch already past `collecting` is left
    /// alone.
    async fn release(&self, batch: ReleasedBatch) -> BotResult<()> {
        let result = sqlx::query(
            "UPDATE batches SET status = 'released', released_at = ? \
             WHERE id = ? AND status = 'collecting'",
        )
        .bind(Utc::now())
        .bind(batch.batch_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!("Batch {} was already released", batch.batch_id);
            return Ok(());
        }

        info!("Batch {} released", batch.batch_id);
        if self.released_tx.send(batch).await.is_err() {
            warn!("Released-batch channel is closed; batch will be recovered on restart");
        }
        Ok(())
    }
}

/// Claims a released batch for processing. The guarded UPDATE makes the
/// `released -> processing` transition exactly-once across workers.
pub async fn claim(db: &Database, batch_id: i64) -> BotResult<()> {
    let result = sqlx::query(
        "UPDATE batches SET status = 'processing' WHERE id = ? AND status = 'released'",
    )
    .bind(batch_id)
    .execute(db.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(BotError::BatchAlreadyClaimed(batch_id));
    }
    Ok(())
}

pub async fn finish(db: &Database, batch_id: i64, status: BatchStatus) -> BotResult<()> {
    sqlx::query("UPDATE batches SET status = ?, completed_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn get_batch(db: &Database, batch_id: i64) -> BotResult<BatchRow> {
    let batch = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = ?")
        .bind(batch_id)
        .fetch_one(db.pool())
        .await?;
    Ok(batch)
}

pub async fn insert_job(db: &Database, batch_id: i64, input_file_id: &str) -> BotResult<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO generation_jobs (batch_id, input_file_id, status, created_at, updated_at) \
         VALUES (?, ?, 'pending', ?, ?)",
    )
    .bind(batch_id)
    .bind(input_file_id)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn jobs_for_batch(db: &Database, batch_id: i64) -> BotResult<Vec<GenerationJobRow>> {
    let jobs = sqlx::query_as::<_, GenerationJobRow>(
        "SELECT * FROM generation_jobs WHERE batch_id = ? ORDER BY id",
    )
    .bind(batch_id)
    .fetch_all(db.pool())
    .await?;
    Ok(jobs)
}

/// Startup recovery: batches left non-terminal by a previous process are
/// safely abandoned. Reserved credits on unfinished jobs are refunded and
/// the batch is failed rather than replayed.
pub async fn abandon_unfinished(db: &Database) -> BotResult<usize> {
    let stale = sqlx::query_as::<_, BatchRow>(
        "SELECT * FROM batches WHERE status IN ('collecting', 'released', 'processing')",
    )
    .fetch_all(db.pool())
    .await?;

    for batch in &stale {
        let jobs = jobs_for_batch(db, batch.id).await?;
        for job in jobs {
            if !matches!(job.status, JobStatus::Pending | JobStatus::InFlight) {
                continue;
            }
            if job.reserved_credits > 0 {
                ledger::refund(db, batch.user_id, job.reserved_credits).await?;
            }
            sqlx::query(
                "UPDATE generation_jobs SET status = 'failed', error = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind("abandoned on restart")
            .bind(Utc::now())
            .bind(job.id)
            .execute(db.pool())
            .await?;
        }
        finish(db, batch.id, BatchStatus::Failed).await?;
        warn!("Abandoned unfinished batch {} from a previous run", batch.id);
    }

    // Jobs left non-terminal inside batches that are already terminal (a
    // straggler photo that raced its album's release) are settled the same
    // way, so no job can stay pending forever.
    let orphans: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT j.id, b.user_id, j.reserved_credits FROM generation_jobs j \
         JOIN batches b ON b.id = j.batch_id \
         WHERE b.status IN ('completed', 'failed') \
         AND j.status IN ('pending', 'in_flight')",
    )
    .fetch_all(db.pool())
    .await?;
    for (job_id, user_id, reserved) in orphans {
        if reserved > 0 {
            ledger::refund(db, user_id, reserved).await?;
        }
        sqlx::query(
            "UPDATE generation_jobs SET status = 'failed', error = ?, updated_at = ? WHERE id = ?",
        )
        .bind("abandoned on restart")
        .bind(Utc::now())
        .bind(job_id)
        .execute(db.pool())
        .await?;
        warn!("Settled orphaned job {job_id} left in a terminal batch");
    }

    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn test_policy() -> BatchPolicy {
        BatchPolicy {
            quiet_period: Duration::from_millis(50),
            hard_timeout: Duration::from_millis(500),
            max_photos: 10,
        }
    }

    async fn setup() -> (Database, i64) {
        let db = Database::init_in_memory().await.unwrap();
        let user = db
            .get_or_create_user(500, Some("album"), None, 10)
            .await
            .unwrap();
        (db, user.id)
    }

    async fn expect_release(rx: &mut mpsc::Receiver<ReleasedBatch>) -> ReleasedBatch {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for release")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn single_photo_releases_immediately() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        let batch_id = tracker
            .add_photo(1, user_id, None, None, "file-1")
            .await
            .unwrap();

        let released = expect_release(&mut rx).await;
        assert_eq!(released.batch_id, batch_id);
        let batch = get_batch(&db, batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Released);
        assert_eq!(jobs_for_batch(&db, batch_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn declared_size_releases_exactly_once() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        for index in 0..3 {
            tracker
                .add_photo(1, user_id, Some("album-a"), Some(3), &format!("file-{index}"))
                .await
                .unwrap();
        }

        let released = expect_release(&mut rx).await;
        assert_eq!(jobs_for_batch(&db, released.batch_id).await.unwrap().len(), 3);

        // No second release for the same album.
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn quiet_period_releases_partial_album() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        tracker
            .add_photo(1, user_id, Some("album-b"), None, "file-1")
            .await
            .unwrap();
        tracker
            .add_photo(1, user_id, Some("album-b"), None, "file-2")
            .await
            .unwrap();

        let released = expect_release(&mut rx).await;
        let batch = get_batch(&db, released.batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Released);
        assert_eq!(jobs_for_batch(&db, released.batch_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn max_photos_cap_forces_release() {
        let (db, user_id) = setup().await;
        let policy = BatchPolicy {
            max_photos: 2,
            ..test_policy()
        };
        let (tracker, mut rx) = BatchTracker::new(db.clone(), policy);

        tracker
            .add_photo(1, user_id, Some("album-c"), None, "file-1")
            .await
            .unwrap();
        tracker
            .add_photo(1, user_id, Some("album-c"), None, "file-2")
            .await
            .unwrap();

        let released = expect_release(&mut rx).await;
        assert_eq!(jobs_for_batch(&db, released.batch_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn claim_is_exactly_once() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        tracker
            .add_photo(1, user_id, None, None, "file-1")
            .await
            .unwrap();
        let released = expect_release(&mut rx).await;

        claim(&db, released.batch_id).await.unwrap();
        let err = claim(&db, released.batch_id).await.unwrap_err();
        assert!(matches!(err, BotError::BatchAlreadyClaimed(_)));
    }

    #[tokio::test]
    async fn late_album_photo_gets_its_own_batch() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        let first = tracker
            .add_photo(1, user_id, Some("album-e"), Some(1), "file-1")
            .await
            .unwrap();
        let released = expect_release(&mut rx).await;
        assert_eq!(released.batch_id, first);
        claim(&db, first).await.unwrap();
        finish(&db, first, BatchStatus::Completed).await.unwrap();

        // Same album id, but the finished batch must not swallow the photo.
        let straggler = tracker
            .add_photo(1, user_id, Some("album-e"), Some(1), "file-2")
            .await
            .unwrap();
        assert_ne!(straggler, first);

        let released = expect_release(&mut rx).await;
        assert_eq!(released.batch_id, straggler);
        assert_eq!(jobs_for_batch(&db, straggler).await.unwrap().len(), 1);
        assert_eq!(jobs_for_batch(&db, first).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn startup_sweep_settles_jobs_orphaned_in_terminal_batches() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        tracker
            .add_photo(1, user_id, None, None, "file-1")
            .await
            .unwrap();
        let released = expect_release(&mut rx).await;
        claim(&db, released.batch_id).await.unwrap();
        finish(&db, released.batch_id, BatchStatus::Completed)
            .await
            .unwrap();

        // A job recorded against the batch after it finished.
        let orphan = insert_job(&db, released.batch_id, "file-late").await.unwrap();

        abandon_unfinished(&db).await.unwrap();

        let jobs = jobs_for_batch(&db, released.batch_id).await.unwrap();
        let late = jobs.iter().find(|job| job.id == orphan).unwrap();
        assert_eq!(late.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn unfinished_batches_are_abandoned_with_refunds() {
        let (db, user_id) = setup().await;
        let (tracker, mut rx) = BatchTracker::new(db.clone(), test_policy());

        tracker
            .add_photo(1, user_id, None, None, "file-1")
            .await
            .unwrap();
        let released = expect_release(&mut rx).await;
        claim(&db, released.batch_id).await.unwrap();

        // Simulate a crash after the debit was reserved.
        crate::ledger::debit(&db, user_id, 1).await.unwrap();
        sqlx::query(
            "UPDATE generation_jobs SET status = 'in_flight', reserved_credits = 1 \
             WHERE batch_id = ?",
        )
        .bind(released.batch_id)
        .execute(db.pool())
        .await
        .unwrap();

        let abandoned = abandon_unfinished(&db).await.unwrap();
        assert_eq!(abandoned, 1);

        let batch = get_batch(&db, released.batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(crate::ledger::balance(&db, user_id).await.unwrap(), 10);
        assert_eq!(
            crate::ledger::transaction_sum(&db, user_id).await.unwrap(),
            10
        );
    }
}
