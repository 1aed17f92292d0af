//! Delivery status vocabulary shared by campaign recipients and conversation
//! messages, and the rule for applying asynchronous status callbacks.
//!
//! Provider callbacks arrive out of order and are retried, so status updates
//! only ever move forward: `pending < sent < delivered < read`, with `failed`
//! terminal and only reachable before delivery.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    Ignore,
}

/// Map the gateway's status vocabulary onto ours. `deleted`, `warning` and
/// anything unrecognised carry no delivery information and are ignored.
pub fn map_provider_status(raw: &str) -> Option<RecipientStatus> {
    match raw.trim().to_lowercase().as_str() {
        "sent" => Some(RecipientStatus::Sent),
        "delivered" => Some(RecipientStatus::Delivered),
        "read" | "played" => Some(RecipientStatus::Read),
        "failed" | "undeliverable" => Some(RecipientStatus::Failed),
        _ => None,
    }
}

impl RecipientStatus {
    pub const ALL: [RecipientStatus; 5] = [
        RecipientStatus::Pending,
        RecipientStatus::Sent,
        RecipientStatus::Delivered,
        RecipientStatus::Read,
        RecipientStatus::Failed,
    ];

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Ok(RecipientStatus::Pending),
            "sent" => Ok(RecipientStatus::Sent),
            "delivered" => Ok(RecipientStatus::Delivered),
            "read" => Ok(RecipientStatus::Read),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(CoreError::invalid(
                "status",
                format!("unknown delivery status '{other}'"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Delivered => "delivered",
            RecipientStatus::Read => "read",
            RecipientStatus::Failed => "failed",
        }
    }

    /// Progress rank. Mirrored by the `delivery_rank()` SQL function so the
    /// database can guard concurrent webhook updates with the same ordering.
    pub fn rank(self) -> i16 {
        match self {
            RecipientStatus::Pending => 0,
            RecipientStatus::Sent => 1,
            RecipientStatus::Delivered => 2,
            RecipientStatus::Read => 3,
            RecipientStatus::Failed => 4,
        }
    }

    pub fn apply(self, next: RecipientStatus) -> Transition {
        use RecipientStatus::*;
        match (self, next) {
            (Failed, _) => Transition::Ignore,
            (Pending | Sent, Failed) => Transition::Advance,
            (_, Failed) => Transition::Ignore,
            (current, next) if next.rank() > current.rank() => Transition::Advance,
            _ => Transition::Ignore,
        }
    }

    /// Settled recipients need no further callbacks for campaign completion.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            RecipientStatus::Delivered | RecipientStatus::Read | RecipientStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::RecipientStatus::*;
    use super::*;

    #[test]
    fn provider_vocabulary_maps_to_internal_status() {
        assert_eq!(map_provider_status("sent"), Some(Sent));
        assert_eq!(map_provider_status("DELIVERED"), Some(Delivered));
        assert_eq!(map_provider_status("read"), Some(Read));
        assert_eq!(map_provider_status("failed"), Some(Failed));
        assert_eq!(map_provider_status("deleted"), None);
        assert_eq!(map_provider_status("warning"), None);
        assert_eq!(map_provider_status("bogus"), None);
    }

    #[test]
    fn status_only_moves_forward() {
        assert_eq!(Pending.apply(Sent), Transition::Advance);
        assert_eq!(Sent.apply(Delivered), Transition::Advance);
        assert_eq!(Delivered.apply(Read), Transition::Advance);
        assert_eq!(Read.apply(Delivered), Transition::Ignore);
        assert_eq!(Delivered.apply(Sent), Transition::Ignore);
        assert_eq!(Sent.apply(Sent), Transition::Ignore);
    }

    #[test]
    fn read_may_arrive_before_delivered() {
        assert_eq!(Sent.apply(Read), Transition::Advance);
        assert_eq!(Read.apply(Delivered), Transition::Ignore);
    }

    #[test]
    fn failure_only_before_delivery_and_is_terminal() {
        assert_eq!(Pending.apply(Failed), Transition::Advance);
        assert_eq!(Sent.apply(Failed), Transition::Advance);
        assert_eq!(Delivered.apply(Failed), Transition::Ignore);
        assert_eq!(Read.apply(Failed), Transition::Ignore);
        for next in RecipientStatus::ALL {
            assert_eq!(Failed.apply(next), Transition::Ignore);
        }
    }

    #[test]
    fn settled_statuses() {
        assert!(!Pending.is_settled());
        assert!(!Sent.is_settled());
        assert!(Delivered.is_settled());
        assert!(Read.is_settled());
        assert!(Failed.is_settled());
    }

    #[test]
    fn parse_accepts_internal_names() {
        for status in RecipientStatus::ALL {
            assert_eq!(RecipientStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RecipientStatus::parse("queued").is_err());
    }
}
