use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::campaigns::CampaignStatus;
use crate::delivery::RecipientStatus;

pub const DEFAULT_COMPLETION_GRACE_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct StatusCounts {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (RecipientStatus, i64)>,
    {
        let mut counts = StatusCounts::default();
        for (status, n) in pairs {
            counts.total += n;
            match status {
                RecipientStatus::Pending => counts.pending += n,
                RecipientStatus::Sent => counts.sent += n,
                RecipientStatus::Delivered => counts.delivered += n,
                RecipientStatus::Read => counts.read += n,
                RecipientStatus::Failed => counts.failed += n,
            }
        }
        counts
    }

    pub fn dispatched(&self) -> i64 {
        self.total - self.pending
    }

    pub fn delivered_or_better(&self) -> i64 {
        self.delivered + self.read
    }

    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.sent == 0
    }

    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct CampaignStats {
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// (delivered + read) / dispatched
    pub delivery_rate: f64,
    /// read / dispatched
    pub read_rate: f64,
    /// failed / dispatched
    pub failure_rate: f64,
}

impl CampaignStats {
    pub fn from_counts(counts: StatusCounts) -> Self {
        let dispatched = counts.dispatched();
        CampaignStats {
            counts,
            delivery_rate: ratio(counts.delivered_or_better(), dispatched),
            read_rate: ratio(counts.read, dispatched),
            failure_rate: ratio(counts.failed, dispatched),
        }
    }
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 10_000.0
}

/// A dispatched campaign completes once every recipient is settled, or when
/// receipts have been awaited for the whole grace period.
pub fn should_complete(
    status: CampaignStatus,
    counts: &StatusCounts,
    dispatched_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    if status != CampaignStatus::Sent {
        return false;
    }
    if counts.is_settled() {
        return true;
    }
    matches!(dispatched_at, Some(at) if now - at >= grace)
}
