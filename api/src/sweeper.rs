//! Periodic maintenance: expire lapsed customer windows, apply parked
//! delivery statuses whose message has been stored, and complete dispatched
//! campaigns whose receipts have settled or stopped arriving.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::begin_service;
use crate::ingest::{purge_parked, reconcile_parked, refresh_campaign};
use crate::state::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub conversations_expired: u64,
    pub statuses_reconciled: u64,
    pub parked_purged: u64,
    pub campaigns_completed: u64,
}

/// Parked statuses whose message never shows up are dropped after this long.
const PARKED_RETENTION_DAYS: i64 = 7;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let mut interval =
        tokio::time::interval(StdDuration::from_secs(state.config.window_sweep_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!("window sweeper started");

    loop {
        interval.tick().await;
        match sweep(&state.db, state.config.completion_grace()).await {
            Ok(report) if report != SweepReport::default() => tracing::info!(
                conversations_expired = report.conversations_expired,
                statuses_reconciled = report.statuses_reconciled,
                parked_purged = report.parked_purged,
                campaigns_completed = report.campaigns_completed,
                "sweep finished"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "sweep failed"),
        }
    }
}

pub async fn sweep(pool: &PgPool, completion_grace: Duration) -> Result<SweepReport, sqlx::Error> {
    let conversations_expired = expire_windows(pool).await?;
    let (statuses_reconciled, parked_purged) = reconcile_parked_statuses(pool, completion_grace).await?;
    Ok(SweepReport {
        conversations_expired,
        statuses_reconciled,
        parked_purged,
        campaigns_completed: complete_campaigns(pool, completion_grace).await?,
    })
}

/// `open` conversations whose window has lapsed become `expired`. The
/// predicate matches `WindowState::should_expire`.
pub async fn expire_windows(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    let expired = sqlx::query(
        "UPDATE conversations SET status = 'expired', updated_at = NOW() \
         WHERE status = 'open' AND window_expires_at <= NOW()",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    Ok(expired)
}

/// Apply parked statuses whose message is now stored, then drop the ones
/// that have waited too long. Returns `(applied, purged)`.
async fn reconcile_parked_statuses(
    pool: &PgPool,
    completion_grace: Duration,
) -> Result<(u64, u64), sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    let replay = reconcile_parked(&mut tx).await?;
    let now = Utc::now();
    for campaign_id in &replay.campaigns {
        refresh_campaign(&mut tx, *campaign_id, now, completion_grace).await?;
    }
    let purged = purge_parked(&mut tx, Duration::days(PARKED_RETENTION_DAYS)).await?;
    tx.commit().await?;
    Ok((replay.applied, purged))
}

/// Each campaign is refreshed in its own short transaction, so the sweep
/// never holds more than one campaign row and takes locks in the same order
/// as webhook ingest.
async fn complete_campaigns(pool: &PgPool, completion_grace: Duration) -> Result<u64, sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    let candidates: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM campaigns WHERE status = 'sent' ORDER BY dispatched_at, id",
    )
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    let now = Utc::now();
    let mut completed = 0;
    for campaign_id in candidates {
        let mut tx = begin_service(pool).await?;
        if refresh_campaign(&mut tx, campaign_id, now, completion_grace).await? {
            completed += 1;
        }
        tx.commit().await?;
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::recompute_campaign_analytics;
    use crate::db::testing::{
        add_recipient, campaign_fixture, campaign_status, db_pool_if_available, load_recipient,
    };

    #[tokio::test]
    async fn sweep_waits_behind_ingest_instead_of_deadlocking() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        let fixture = campaign_fixture(&pool, "sent").await;
        let wamid = format!("wamid.{}", Uuid::now_v7());
        add_recipient(&pool, &fixture, "delivered", Some(wamid.as_str())).await;

        // Ingest holds the analytics row and is about to complete the campaign.
        let mut ingest = begin_service(&pool).await.unwrap();
        recompute_campaign_analytics(&mut ingest, fixture.campaign_id).await.unwrap();

        let sweep_pool = pool.clone();
        let sweeper = tokio::spawn(async move {
            complete_campaigns(&sweep_pool, Duration::hours(72)).await
        });
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let completed = tokio::time::timeout(
            StdDuration::from_secs(5),
            refresh_campaign(&mut ingest, fixture.campaign_id, Utc::now(), Duration::hours(72)),
        )
        .await
        .expect("ingest must not wait on the sweeper")
        .unwrap();
        assert!(completed);
        ingest.commit().await.unwrap();

        sweeper.await.unwrap().unwrap();
        assert_eq!(campaign_status(&pool, fixture.campaign_id).await, "completed");
    }

    #[tokio::test]
    async fn parked_status_committed_after_the_send_is_reconciled() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        let fixture = campaign_fixture(&pool, "sent").await;
        let wamid = format!("wamid.{}", Uuid::now_v7());
        let (_, recipient_id) = add_recipient(&pool, &fixture, "sent", Some(wamid.as_str())).await;

        let mut tx = begin_service(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO parked_statuses (provider_message_id, status, occurred_at) VALUES ($1, 'read', NOW())",
        )
        .bind(&wamid)
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.commit().await.unwrap();

        reconcile_parked_statuses(&pool, Duration::hours(72)).await.unwrap();

        let row = load_recipient(&pool, recipient_id).await;
        assert_eq!(row.status, "read");
        assert!(row.read_at.is_some());
        assert!(row.delivered_at.is_some());
        assert_eq!(campaign_status(&pool, fixture.campaign_id).await, "completed");
    }
}
