//! Batch processing pipeline. Takes a released batch, debits one credit per
//! photo, runs the generation service for each job, and delivers results as
//! they finish. Generation and delivery are injected, so the pipeline's
//! money handling is testable without the network.

use std::future::Future;

use chrono::Utc;
use tracing::{info, warn};

use crate::batch::{self, ReleasedBatch};
use crate::db::database::Database;
use crate::db::models::{BatchStatus, GenerationJobRow};
use crate::error::{BotError, BotResult};
use crate::ledger;

/// Every photo costs one credit, debited just before its job starts.
pub const CREDITS_PER_PHOTO: i64 = 1;

/// Per-photo result handed to the delivery callback as soon as the job
/// finishes. Slow albums trickle out instead of blocking on the last photo.
#[derive(Debug, Clone)]
pub enum Delivery {
    Photo { job_id: i64, output_file_id: String },
    Failure { job_id: i64, message: String },
}

fn failure_message(err: &BotError) -> String {
    match err {
        BotError::InsufficientCredits { balance, required } => format!(
            "Not enough credits for this photo: you have {balance}, it costs {required}. \
             Use /buy to top up."
        ),
        BotError::ServiceTimeout(_) => {
            "The photo service took too long to respond. Your credit was refunded, \
             please try again."
                .to_string()
        }
        _ => "This photo could not be processed. Your credit was refunded.".to_string(),
    }
}

/// Runs one released batch to a terminal state.
///
/// Each job is debited, generated, and delivered independently; a failure
/// after the debit refunds that job's credit. The batch ends `failed` only
/// when no job ever got past its debit, otherwise `completed`.
pub async fn process_released_batch<G, GFut, D, DFut>(
    db: &Database,
    released: &ReleasedBatch,
    generate: G,
    deliver: D,
) -> BotResult<BatchStatus>
where
    G: Fn(String) -> GFut,
    GFut: Future<Output = BotResult<String>>,
    D: Fn(Delivery) -> DFut,
    DFut: Future<Output = ()>,
{
    batch::claim(db, released.batch_id).await?;
    let jobs = batch::jobs_for_batch(db, released.batch_id).await?;
    info!(
        "Processing batch {} with {} job(s)",
        released.batch_id,
        jobs.len()
    );

    let mut succeeded = 0usize;
    let mut debited = 0usize;

    for job in &jobs {
        match run_job(db, released.user_id, job, &generate).await {
            Ok(JobRun::Succeeded { output_file_id }) => {
                debited += 1;
                succeeded += 1;
                deliver(Delivery::Photo {
                    job_id: job.id,
                    output_file_id,
                })
                .await;
            }
            Ok(JobRun::Failed { past_debit, error }) => {
                if past_debit {
                    debited += 1;
                }
                deliver(Delivery::Failure {
                    job_id: job.id,
                    message: failure_message(&error),
                })
                .await;
            }
            Err(err) => {
                // Storage failure mid-batch: stop here, recovery on restart
                // refunds whatever is still reserved.
                warn!("Batch {} aborted on job {}: {err}", released.batch_id, job.id);
                return Err(err);
            }
        }
    }

    if succeeded > 0 {
        db.mark_processed(released.user_id, succeeded as i64).await?;
    }

    let status = if debited == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    };
    batch::finish(db, released.batch_id, status).await?;
    info!(
        "Batch {} finished as {status:?}: {succeeded}/{} photo(s) generated",
        released.batch_id,
        jobs.len()
    );
    Ok(status)
}

enum JobRun {
    Succeeded { output_file_id: String },
    Failed { past_debit: bool, error: BotError },
}

/// One job: debit, mark in-flight, generate, settle. Business failures come
/// back as `JobRun::Failed`; only storage errors propagate.
async fn run_job<G, GFut>(
    db: &Database,
    user_id: i64,
    job: &GenerationJobRow,
    generate: &G,
) -> BotResult<JobRun>
where
    G: Fn(String) -> GFut,
    GFut: Future<Output = BotResult<String>>,
{
    if let Err(err) = ledger::debit(db, user_id, CREDITS_PER_PHOTO).await {
        match err {
            BotError::InsufficientCredits { .. } | BotError::UnknownUser(_) => {
                mark_failed(db, job.id, &err.to_string()).await?;
                return Ok(JobRun::Failed {
                    past_debit: false,
                    error: err,
                });
            }
            other => return Err(other),
        }
    }

    mark_in_flight(db, job.id, CREDITS_PER_PHOTO).await?;

    match generate(job.input_file_id.clone()).await {
        Ok(output_file_id) => {
            mark_succeeded(db, job.id, &output_file_id).await?;
            Ok(JobRun::Succeeded { output_file_id })
        }
        Err(err) => {
            ledger::refund(db, user_id, CREDITS_PER_PHOTO).await?;
            mark_failed(db, job.id, &err.to_string()).await?;
            warn!("Job {} failed, credit refunded: {err}", job.id);
            Ok(JobRun::Failed {
                past_debit: true,
                error: err,
            })
        }
    }
}

async fn mark_in_flight(db: &Database, job_id: i64, reserved: i64) -> BotResult<()> {
    sqlx::query(
        "UPDATE generation_jobs SET status = 'in_flight', reserved_credits = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(reserved)
    .bind(Utc::now())
    .bind(job_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

async fn mark_succeeded(db: &Database, job_id: i64, output_file_id: &str) -> BotResult<()> {
    sqlx::query(
        "UPDATE generation_jobs SET status = 'succeeded', output_file_id = ?, \
         reserved_credits = 0, updated_at = ? WHERE id = ?",
    )
    .bind(output_file_id)
    .bind(Utc::now())
    .bind(job_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

async fn mark_failed(db: &Database, job_id: i64, error: &str) -> BotResult<()> {
    sqlx::query(
        "UPDATE generation_jobs SET status = 'failed', error = ?, reserved_credits = 0, \
         updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchPolicy, BatchTracker};
    use crate::db::models::JobStatus;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn test_policy() -> BatchPolicy {
        BatchPolicy {
            quiet_period: Duration::from_millis(50),
            hard_timeout: Duration::from_millis(500),
            max_photos: 10,
        }
    }

    async fn setup(credits: i64) -> (Database, i64, BatchTracker, mpsc::Receiver<ReleasedBatch>) {
        let db = Database::init_in_memory().await.unwrap();
        let user = db
            .get_or_create_user(700, Some("runner"), None, credits)
            .await
            .unwrap();
        let (tracker, rx) = BatchTracker::new(db.clone(), test_policy());
        (db, user.id, tracker, rx)
    }

    async fn release_album(
        tracker: &BatchTracker,
        rx: &mut mpsc::Receiver<ReleasedBatch>,
        user_id: i64,
        photos: usize,
    ) -> ReleasedBatch {
        for index in 0..photos {
            tracker
                .add_photo(
                    1,
                    user_id,
                    Some("album-x"),
                    Some(photos),
                    &format!("file-{index}"),
                )
                .await
                .unwrap();
        }
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("release timed out")
            .expect("channel closed")
    }

    fn collecting_deliver(
        log: Arc<Mutex<Vec<Delivery>>>,
    ) -> impl Fn(Delivery) -> std::future::Ready<()> {
        move |delivery| {
            log.lock().push(delivery);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn full_album_is_generated_and_delivered_per_photo() {
        let (db, user_id, tracker, mut rx) = setup(10).await;
        let released = release_album(&tracker, &mut rx, user_id, 4).await;
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let status = process_released_batch(
            &db,
            &released,
            |file_id| async move { Ok(format!("out-{file_id}")) },
            collecting_deliver(deliveries.clone()),
        )
        .await
        .unwrap();

        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(ledger::balance(&db, user_id).await.unwrap(), 6);
        assert_eq!(ledger::transaction_sum(&db, user_id).await.unwrap(), 6);

        let log = deliveries.lock();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|d| matches!(d, Delivery::Photo { .. })));

        let user = db.get_user_by_id(user_id).await.unwrap().unwrap();
        assert_eq!(user.total_processed, 4);
    }

    #[tokio::test]
    async fn short_balance_processes_what_it_covers() {
        let (db, user_id, tracker, mut rx) = setup(3).await;
        let released = release_album(&tracker, &mut rx, user_id, 4).await;
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let status = process_released_batch(
            &db,
            &released,
            |file_id| async move { Ok(format!("out-{file_id}")) },
            collecting_deliver(deliveries.clone()),
        )
        .await
        .unwrap();

        // Three photos fit the balance; the fourth fails on the debit alone.
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(ledger::balance(&db, user_id).await.unwrap(), 0);
        assert_eq!(ledger::transaction_sum(&db, user_id).await.unwrap(), 0);

        let log = deliveries.lock();
        let photos = log
            .iter()
            .filter(|d| matches!(d, Delivery::Photo { .. }))
            .count();
        assert_eq!(photos, 3);
        assert!(matches!(log.last(), Some(Delivery::Failure { .. })));

        let jobs = batch::jobs_for_batch(&db, released.batch_id).await.unwrap();
        assert_eq!(
            jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
            1
        );
    }

    #[tokio::test]
    async fn generation_failure_refunds_the_debit() {
        let (db, user_id, tracker, mut rx) = setup(5).await;
        let released = release_album(&tracker, &mut rx, user_id, 3).await;
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let status = process_released_batch(
            &db,
            &released,
            |file_id| async move {
                if file_id == "file-1" {
                    Err(BotError::ServiceError {
                        message: "generation refused".to_string(),
                        retryable: false,
                    })
                } else {
                    Ok(format!("out-{file_id}"))
                }
            },
            collecting_deliver(deliveries.clone()),
        )
        .await
        .unwrap();

        // Two paid generations, one refunded failure.
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(ledger::balance(&db, user_id).await.unwrap(), 3);
        assert_eq!(ledger::transaction_sum(&db, user_id).await.unwrap(), 3);

        let jobs = batch::jobs_for_batch(&db, released.batch_id).await.unwrap();
        let failed: Vec<_> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reserved_credits, 0);
    }

    #[tokio::test]
    async fn empty_balance_fails_the_whole_batch() {
        let (db, user_id, tracker, mut rx) = setup(0).await;
        let released = release_album(&tracker, &mut rx, user_id, 2).await;
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let status = process_released_batch(
            &db,
            &released,
            |file_id| async move { Ok(format!("out-{file_id}")) },
            collecting_deliver(deliveries.clone()),
        )
        .await
        .unwrap();

        // No job got past its debit, so the batch itself is failed.
        assert_eq!(status, BatchStatus::Failed);
        assert_eq!(ledger::balance(&db, user_id).await.unwrap(), 0);
        assert_eq!(deliveries.lock().len(), 2);
    }

    #[tokio::test]
    async fn a_claimed_batch_cannot_be_processed_twice() {
        let (db, user_id, tracker, mut rx) = setup(5).await;
        let released = release_album(&tracker, &mut rx, user_id, 1).await;

        process_released_batch(
            &db,
            &released,
            |file_id| async move { Ok(format!("out-{file_id}")) },
            |_| std::future::ready(()),
        )
        .await
        .unwrap();

        let err = process_released_batch(
            &db,
            &released,
            |file_id| async move { Ok(format!("out-{file_id}")) },
            |_| std::future::ready(()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BotError::BatchAlreadyClaimed(_)));
        assert_eq!(ledger::balance(&db, user_id).await.unwrap(), 4);
    }
}
