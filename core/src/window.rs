//! Customer service window tracking.
//!
//! WhatsApp only accepts free-form (non-template) messages to a customer within
//! 24 hours of that customer's last inbound message. Each conversation keeps the
//! timestamp of the last inbound message and the resulting expiry; every
//! outbound send is gated through [`WindowState::can_send`].
//!
//! The persisted `status` is advisory between sweeps: a conversation whose
//! expiry has passed reads as expired through [`WindowState::effective_status`]
//! even before the periodic sweep rewrites the row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

pub const CUSTOMER_WINDOW_HOURS: i64 = 24;

pub fn customer_window() -> Duration {
    Duration::hours(CUSTOMER_WINDOW_HOURS)
}

pub fn expiry_for(last_inbound_at: DateTime<Utc>) -> DateTime<Utc> {
    last_inbound_at + customer_window()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Expired,
    Closed,
}

impl ConversationStatus {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_lowercase().as_str() {
            "open" => Ok(ConversationStatus::Open),
            "expired" => Ok(ConversationStatus::Expired),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(CoreError::invalid(
                "status",
                format!("unknown conversation status '{other}'"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Expired => "expired",
            ConversationStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    FreeForm,
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    NoInboundMessage,
    WindowExpired { expired_at: DateTime<Utc> },
    ConversationClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Allowed,
    Blocked(BlockReason),
}

impl SendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SendDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub status: ConversationStatus,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub window_expires_at: Option<DateTime<Utc>>,
}

impl WindowState {
    /// A conversation started by us (e.g. a template reply to a campaign
    /// recipient) has no window until the customer writes back.
    pub fn new() -> Self {
        WindowState {
            status: ConversationStatus::Open,
            last_inbound_at: None,
            window_expires_at: None,
        }
    }

    /// Record an inbound customer message. Reopens expired and closed
    /// conversations; an older, out-of-order message never shrinks the window.
    pub fn on_inbound(&mut self, at: DateTime<Utc>) {
        let latest = match self.last_inbound_at {
            Some(previous) if previous > at => previous,
            _ => at,
        };
        self.last_inbound_at = Some(latest);
        self.window_expires_at = Some(expiry_for(latest));
        self.status = ConversationStatus::Open;
    }

    pub fn close(&mut self) {
        self.status = ConversationStatus::Closed;
    }

    pub fn is_window_open(&self, now: DateTime<Utc>) -> bool {
        matches!(self.window_expires_at, Some(expires) if now < expires)
    }

    pub fn effective_status(&self, now: DateTime<Utc>) -> ConversationStatus {
        match self.status {
            ConversationStatus::Open if self.should_expire(now) => ConversationStatus::Expired,
            status => status,
        }
    }

    /// Sweep predicate: open conversations whose window has lapsed.
    pub fn should_expire(&self, now: DateTime<Utc>) -> bool {
        self.status == ConversationStatus::Open
            && matches!(self.window_expires_at, Some(expires) if now >= expires)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.window_expires_at
            .filter(|expires| now < *expires)
            .map(|expires| expires - now)
    }

    pub fn can_send(&self, kind: SendKind, now: DateTime<Utc>) -> SendDecision {
        if self.status == ConversationStatus::Closed {
            return SendDecision::Blocked(BlockReason::ConversationClosed);
        }
        if kind == SendKind::Template {
            return SendDecision::Allowed;
        }
        match self.window_expires_at {
            None => SendDecision::Blocked(BlockReason::NoInboundMessage),
            Some(expires) if now >= expires => {
                SendDecision::Blocked(BlockReason::WindowExpired { expired_at: expires })
            }
            Some(_) => SendDecision::Allowed,
        }
    }
}

impl Default for WindowState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn inbound_opens_a_24h_window() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        assert_eq!(w.window_expires_at, Some(t0() + Duration::hours(24)));
        assert!(w.is_window_open(t0() + Duration::hours(23)));
        assert_eq!(w.remaining(t0() + Duration::hours(20)), Some(Duration::hours(4)));
    }

    #[test]
    fn window_is_half_open_at_expiry() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        let expiry = t0() + Duration::hours(24);
        assert!(w.is_window_open(expiry - Duration::seconds(1)));
        assert!(!w.is_window_open(expiry));
        assert_eq!(
            w.can_send(SendKind::FreeForm, expiry),
            SendDecision::Blocked(BlockReason::WindowExpired { expired_at: expiry })
        );
        assert!(w.remaining(expiry).is_none());
    }

    #[test]
    fn free_form_needs_an_inbound_message() {
        let w = WindowState::new();
        assert_eq!(
            w.can_send(SendKind::FreeForm, t0()),
            SendDecision::Blocked(BlockReason::NoInboundMessage)
        );
        assert!(w.can_send(SendKind::Template, t0()).is_allowed());
    }

    #[test]
    fn templates_pass_an_expired_window() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        assert!(w.can_send(SendKind::Template, t0() + Duration::days(3)).is_allowed());
    }

    #[test]
    fn closed_conversation_blocks_everything() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        w.close();
        assert_eq!(
            w.can_send(SendKind::Template, t0()),
            SendDecision::Blocked(BlockReason::ConversationClosed)
        );
        assert_eq!(
            w.can_send(SendKind::FreeForm, t0()),
            SendDecision::Blocked(BlockReason::ConversationClosed)
        );
    }

    #[test]
    fn new_inbound_extends_and_reopens() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        w.status = ConversationStatus::Expired;
        let later = t0() + Duration::hours(30);
        w.on_inbound(later);
        assert_eq!(w.status, ConversationStatus::Open);
        assert_eq!(w.window_expires_at, Some(later + Duration::hours(24)));

        w.close();
        w.on_inbound(later + Duration::hours(1));
        assert_eq!(w.status, ConversationStatus::Open);
    }

    #[test]
    fn out_of_order_inbound_never_shrinks_window() {
        let mut w = WindowState::new();
        let late = t0() + Duration::hours(5);
        w.on_inbound(late);
        w.on_inbound(t0());
        assert_eq!(w.last_inbound_at, Some(late));
        assert_eq!(w.window_expires_at, Some(late + Duration::hours(24)));
    }

    #[test]
    fn effective_status_reads_expired_before_sweep() {
        let mut w = WindowState::new();
        w.on_inbound(t0());
        let after = t0() + Duration::hours(25);
        assert_eq!(w.status, ConversationStatus::Open);
        assert!(w.should_expire(after));
        assert_eq!(w.effective_status(after), ConversationStatus::Expired);
        assert_eq!(w.effective_status(t0()), ConversationStatus::Open);
    }

    #[test]
    fn sweep_ignores_closed_and_windowless_conversations() {
        let never = WindowState::new();
        assert!(!never.should_expire(t0() + Duration::days(10)));

        let mut closed = WindowState::new();
        closed.on_inbound(t0());
        closed.close();
        assert!(!closed.should_expire(t0() + Duration::days(10)));
        assert_eq!(
            closed.effective_status(t0() + Duration::days(10)),
            ConversationStatus::Closed
        );
    }

    #[test]
    fn status_parse_roundtrips_as_str() {
        for status in [
            ConversationStatus::Open,
            ConversationStatus::Expired,
            ConversationStatus::Closed,
        ] {
            assert_eq!(ConversationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ConversationStatus::parse("archived").is_err());
    }
}
