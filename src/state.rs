use crate::batch::BatchTracker;
use crate::db::database::Database;
use crate::referral::ReferralPolicy;

/// Shared handler context, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub batches: BatchTracker,
    pub referral: ReferralPolicy,
}

impl AppState {
    pub fn new(db: Database, batches: BatchTracker, referral: ReferralPolicy) -> Self {
        AppState {
            db,
            batches,
            referral,
        }
    }
}
