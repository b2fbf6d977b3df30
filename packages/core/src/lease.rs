//! Job leases, the cross-process mutual-exclusion token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A time-bounded claim on a job held by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Random token identifying this particular acquisition.
    pub token: String,
    pub renewed_count: u32,
}

impl Lease {
    /// A lease is live until its expiry instant.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
