//! Campaign lifecycle, batching and retry policy.
//!
//! ```text
//! draft ──schedule──▶ scheduled ──begin──▶ sending ──finish──▶ sent ──complete──▶ completed
//!   │                    │                   │
//!   └────start───────────┴──────────────────▶│──fail──▶ failed
//!   └──────cancel────────┴───────cancel──────┴────────▶ cancelled
//! ```

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignAction {
    Schedule,
    Start,
    BeginSending,
    FinishDispatch,
    Complete,
    Cancel,
    Fail,
}

impl CampaignAction {
    fn as_str(self) -> &'static str {
        match self {
            CampaignAction::Schedule => "schedule",
            CampaignAction::Start => "start",
            CampaignAction::BeginSending => "begin sending",
            CampaignAction::FinishDispatch => "finish dispatching",
            CampaignAction::Complete => "complete",
            CampaignAction::Cancel => "cancel",
            CampaignAction::Fail => "fail",
        }
    }
}

impl CampaignStatus {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_lowercase().as_str() {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(CoreError::invalid(
                "status",
                format!("unknown campaign status '{other}'"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn transition(self, action: CampaignAction) -> Result<CampaignStatus, CoreError> {
        use CampaignAction as A;
        use CampaignStatus as S;
        let next = match (self, action) {
            (S::Draft, A::Schedule) => S::Scheduled,
            (S::Draft | S::Scheduled, A::Start | A::BeginSending) => S::Sending,
            (S::Sending, A::FinishDispatch) => S::Sent,
            (S::Sent, A::Complete) => S::Completed,
            (S::Draft | S::Scheduled | S::Sending, A::Cancel) => S::Cancelled,
            (S::Sending, A::Fail) => S::Failed,
            _ => {
                return Err(CoreError::InvalidTransition {
                    from: self.as_str().to_string(),
                    action: action.as_str().to_string(),
                });
            }
        };
        Ok(next)
    }

    pub fn is_editable(self) -> bool {
        self == CampaignStatus::Draft
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }
}

pub const DEFAULT_BATCH_SIZE: i32 = 50;
pub const MAX_BATCH_SIZE: i32 = 1000;
pub const DEFAULT_BATCH_DELAY_MS: i32 = 1000;
pub const MAX_BATCH_DELAY_MS: i32 = 60_000;

/// How a campaign's recipients are chunked towards the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: i32,
    pub batch_delay: StdDuration,
}

impl BatchPlan {
    pub fn new(batch_size: Option<i32>, batch_delay_ms: Option<i32>) -> Result<Self, CoreError> {
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(CoreError::invalid(
                "batch_size",
                format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }
        let delay_ms = batch_delay_ms.unwrap_or(DEFAULT_BATCH_DELAY_MS);
        if !(0..=MAX_BATCH_DELAY_MS).contains(&delay_ms) {
            return Err(CoreError::invalid(
                "batch_delay_ms",
                format!("batch_delay_ms must be between 0 and {MAX_BATCH_DELAY_MS}"),
            ));
        }
        Ok(BatchPlan {
            batch_size,
            batch_delay: StdDuration::from_millis(delay_ms as u64),
        })
    }
}

impl Default for BatchPlan {
    fn default() -> Self {
        BatchPlan {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: StdDuration::from_millis(DEFAULT_BATCH_DELAY_MS as u64),
        }
    }
}

/// Why a single send did not go through, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Transient,
    RateLimited { retry_after: Option<Duration> },
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Retry { at: DateTime<Utc> },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(15),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: i32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Decide what happens after `attempts_made` sends (including the one that
    /// just failed).
    pub fn next(&self, attempts_made: i32, failure: SendFailure, now: DateTime<Utc>) -> AttemptOutcome {
        if failure == SendFailure::Permanent || attempts_made >= self.max_attempts {
            return AttemptOutcome::GiveUp;
        }
        let exponent = (attempts_made - 1).clamp(0, 16) as u32;
        let backoff = (self.base_delay * 2_i32.pow(exponent)).min(self.max_delay);
        let delay = match failure {
            SendFailure::RateLimited {
                retry_after: Some(retry_after),
            } => backoff.max(retry_after),
            _ => backoff,
        };
        AttemptOutcome::Retry { at: now + delay }
    }
}

#[cfg(test)]
mod tests {
    use super::CampaignAction as A;
    use super::CampaignStatus as S;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn happy_path_lifecycle() {
        let s = S::Draft.transition(A::Schedule).unwrap();
        let s = s.transition(A::BeginSending).unwrap();
        let s = s.transition(A::FinishDispatch).unwrap();
        let s = s.transition(A::Complete).unwrap();
        assert_eq!(s, S::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn draft_can_start_immediately() {
        assert_eq!(S::Draft.transition(A::Start).unwrap(), S::Sending);
    }

    #[test]
    fn cancel_only_before_dispatch_finishes() {
        assert_eq!(S::Draft.transition(A::Cancel).unwrap(), S::Cancelled);
        assert_eq!(S::Scheduled.transition(A::Cancel).unwrap(), S::Cancelled);
        assert_eq!(S::Sending.transition(A::Cancel).unwrap(), S::Cancelled);
        assert!(S::Sent.transition(A::Cancel).is_err());
        assert!(S::Completed.transition(A::Cancel).is_err());
    }

    #[test]
    fn terminal_states_reject_everything() {
        for status in [S::Completed, S::Cancelled, S::Failed] {
            for action in [
                A::Schedule,
                A::Start,
                A::BeginSending,
                A::FinishDispatch,
                A::Complete,
                A::Cancel,
                A::Fail,
            ] {
                assert!(status.transition(action).is_err(), "{:?} {:?}", status, action);
            }
        }
    }

    #[test]
    fn invalid_transition_names_state_and_action() {
        let err = S::Sent.transition(A::Schedule).unwrap_err();
        assert_eq!(err.to_string(), "cannot schedule a campaign in status 'sent'");
    }

    #[test]
    fn only_drafts_are_editable() {
        assert!(S::Draft.is_editable());
        assert!(!S::Scheduled.is_editable());
        assert!(!S::Sending.is_editable());
    }

    #[test]
    fn batch_plan_validates_bounds() {
        let plan = BatchPlan::new(None, None).unwrap();
        assert_eq!(plan, BatchPlan::default());
        assert_eq!(BatchPlan::new(Some(200), Some(0)).unwrap().batch_delay, StdDuration::ZERO);
        assert!(BatchPlan::new(Some(0), None).is_err());
        assert!(BatchPlan::new(Some(1001), None).is_err());
        assert!(BatchPlan::new(None, Some(-1)).is_err());
        assert!(BatchPlan::new(None, Some(60_001)).is_err());
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn retry_backs_off_exponentially() {
        let policy = RetryPolicy::with_max_attempts(5);
        assert_eq!(
            policy.next(1, SendFailure::Transient, now()),
            AttemptOutcome::Retry { at: now() + Duration::seconds(30) }
        );
        assert_eq!(
            policy.next(2, SendFailure::Transient, now()),
            AttemptOutcome::Retry { at: now() + Duration::seconds(60) }
        );
        assert_eq!(
            policy.next(4, SendFailure::Transient, now()),
            AttemptOutcome::Retry { at: now() + Duration::seconds(240) }
        );
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            ..Default::default()
        };
        assert_eq!(
            policy.next(40, SendFailure::Transient, now()),
            AttemptOutcome::Retry { at: now() + Duration::minutes(15) }
        );
    }

    #[test]
    fn rate_limit_honours_longer_retry_after() {
        let policy = RetryPolicy::default();
        let failure = SendFailure::RateLimited {
            retry_after: Some(Duration::seconds(120)),
        };
        assert_eq!(
            policy.next(1, failure, now()),
            AttemptOutcome::Retry { at: now() + Duration::seconds(120) }
        );
        let short = SendFailure::RateLimited {
            retry_after: Some(Duration::seconds(1)),
        };
        assert_eq!(
            policy.next(1, short, now()),
            AttemptOutcome::Retry { at: now() + Duration::seconds(30) }
        );
    }

    #[test]
    fn gives_up_on_permanent_or_exhausted() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next(1, SendFailure::Permanent, now()), AttemptOutcome::GiveUp);
        assert_eq!(policy.next(3, SendFailure::Transient, now()), AttemptOutcome::GiveUp);
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
    }
}
