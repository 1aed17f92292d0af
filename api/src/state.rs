use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::gateway::MessagingGateway;

/// Process-wide outbound send budget shared by the dispatcher and live replies.
pub type SendLimiter = DefaultDirectRateLimiter;

pub fn send_limiter(per_second: u32) -> Arc<SendLimiter> {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate)))
}

/// Take one send from the budget without waiting. When the budget is spent,
/// returns the whole seconds until the next send is allowed (at least 1).
pub fn try_acquire_send(limiter: &SendLimiter) -> Result<(), u64> {
    limiter.check().map_err(|not_until| {
        let wait = not_until.wait_time_from(DefaultClock::default().now());
        (wait.as_secs_f64().ceil() as u64).max(1)
    })
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub send_limiter: Arc<SendLimiter>,
}

/// State for router tests: the pool connects lazily, so requests that are
/// rejected before touching the database need no Postgres.
#[cfg(test)]
pub fn test_state() -> AppState {
    let config = AppConfig::for_tests();
    let db = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("lazy pool from test config");
    AppState {
        db,
        send_limiter: send_limiter(config.send_rate_per_sec),
        gateway: Arc::new(crate::gateway::fake::FakeGateway::default()),
        config: Arc::new(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spent_budget_reports_retry_after() {
        let limiter = send_limiter(1);
        assert_eq!(try_acquire_send(&limiter), Ok(()));
        let retry_after = try_acquire_send(&limiter).unwrap_err();
        assert!((1..=2).contains(&retry_after));
    }
}
