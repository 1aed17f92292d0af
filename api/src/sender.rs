//! Campaign dispatcher.
//!
//! A background worker promotes due scheduled campaigns, then claims one
//! `sending` campaign at a time through a lease on the campaign row
//! (`FOR UPDATE SKIP LOCKED`), so several API instances never send the same
//! recipient twice. Recipients go out in batches through the gateway behind the
//! process-wide send limiter; every batch is persisted before the next one
//! starts, so a crash loses at most one in-flight batch of bookkeeping.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use engage_core::campaigns::{
    AttemptOutcome, BatchPlan, CampaignAction, CampaignStatus, RetryPolicy,
};
use engage_core::contacts::wa_id;
use engage_core::templates::TemplateStatus;

use crate::analytics::recompute_campaign_analytics;
use crate::db::begin_service;
use crate::gateway::{GatewayError, MessagingGateway, OutboundTemplate};
use crate::ingest::reapply_parked;
use crate::state::{AppState, SendLimiter};

pub const LEASE_SECS: i64 = 300;
const DEFAULT_RATE_LIMIT_PAUSE_SECS: i64 = 60;

/// Everything needed to address one campaign's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    pub phone_number_id: String,
    pub template_name: String,
    pub language: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DueRecipient {
    pub id: Uuid,
    pub phone_e164: String,
    pub attempts: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        recipient_id: Uuid,
        attempts: i32,
        provider_message_id: String,
    },
    Failed {
        recipient_id: Uuid,
        attempts: i32,
        error: GatewayError,
    },
    /// Not attempted because the gateway throttled an earlier send in the batch.
    Deferred {
        recipient_id: Uuid,
        retry_after: Option<Duration>,
    },
}

/// Send one batch. A rate-limited response pauses the remainder of the batch:
/// those recipients are deferred without consuming an attempt.
pub async fn dispatch_batch(
    gateway: &dyn MessagingGateway,
    limiter: &SendLimiter,
    context: &DispatchContext,
    recipients: &[DueRecipient],
) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::with_capacity(recipients.len());
    let mut throttled: Option<Option<Duration>> = None;

    for recipient in recipients {
        if let Some(retry_after) = throttled {
            outcomes.push(DispatchOutcome::Deferred {
                recipient_id: recipient.id,
                retry_after,
            });
            continue;
        }

        limiter.until_ready().await;
        let message = OutboundTemplate {
            phone_number_id: context.phone_number_id.clone(),
            to: wa_id(&recipient.phone_e164).to_string(),
            template_name: context.template_name.clone(),
            language: context.language.clone(),
            params: context.params.clone(),
        };
        let attempts = recipient.attempts + 1;
        match gateway.send_template(&message).await {
            Ok(receipt) => outcomes.push(DispatchOutcome::Sent {
                recipient_id: recipient.id,
                attempts,
                provider_message_id: receipt.provider_message_id,
            }),
            Err(error) => {
                if let GatewayError::RateLimited { retry_after } = &error {
                    throttled = Some(*retry_after);
                }
                outcomes.push(DispatchOutcome::Failed {
                    recipient_id: recipient.id,
                    attempts,
                    error,
                });
            }
        }
    }
    outcomes
}

/// Insert one recipient row per eligible contact. Opted-out contacts are
/// skipped; an empty tag filter targets every contact, otherwise contacts
/// carrying any of the tags. Re-running is a no-op for existing recipients.
pub async fn materialize_recipients(conn: &mut PgConnection, campaign_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO campaign_recipients (id, campaign_id, organization_id, contact_id, phone_e164)
        SELECT gen_random_uuid(), c.id, c.organization_id, ct.id, ct.phone_e164
        FROM campaigns c
        JOIN contacts ct ON ct.organization_id = c.organization_id
        WHERE c.id = $1
          AND ct.opted_out = FALSE
          AND (cardinality(c.tag_filter) = 0 OR ct.tags && c.tag_filter)
        ON CONFLICT (campaign_id, contact_id) DO NOTHING
        "#,
    )
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Recipients whose contact opted out after the audience was materialized
/// are failed with `opted_out` instead of being sent.
pub async fn fail_opted_out(conn: &mut PgConnection, campaign_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE campaign_recipients r \
         SET status = 'failed', error_code = 'opted_out', \
             error_message = 'contact opted out before dispatch', failed_at = NOW(), updated_at = NOW() \
         FROM contacts ct \
         WHERE ct.id = r.contact_id AND r.campaign_id = $1 AND r.status = 'pending' AND ct.opted_out",
    )
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// The next pending recipients that are due, oldest first. Opted-out
/// contacts are never returned.
pub async fn due_batch(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    batch_size: i32,
) -> Result<Vec<DueRecipient>, sqlx::Error> {
    sqlx::query_as::<_, DueRecipient>(
        "SELECT r.id, r.phone_e164, r.attempts FROM campaign_recipients r \
         JOIN contacts ct ON ct.id = r.contact_id \
         WHERE r.campaign_id = $1 AND r.status = 'pending' AND r.next_attempt_at <= NOW() \
           AND NOT ct.opted_out \
         ORDER BY r.next_attempt_at, r.id \
         LIMIT $2",
    )
    .bind(campaign_id)
    .bind(i64::from(batch_size))
    .fetch_all(&mut *conn)
    .await
}

/// Write batch outcomes back to the recipient rows. Statuses the gateway
/// reported before this write are applied in the same transaction.
pub async fn persist_outcomes(
    conn: &mut PgConnection,
    outcomes: &[DispatchOutcome],
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut sent_ids = Vec::new();
    for outcome in outcomes {
        match outcome {
            DispatchOutcome::Sent {
                recipient_id,
                attempts,
                provider_message_id,
            } => {
                sqlx::query(
                    "UPDATE campaign_recipients \
                     SET status = 'sent', provider_message_id = $2, attempts = $3, sent_at = $4, \
                         error_code = NULL, error_message = NULL, updated_at = NOW() \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(recipient_id)
                .bind(provider_message_id)
                .bind(attempts)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                sent_ids.push(provider_message_id.clone());
            }
            DispatchOutcome::Failed {
                recipient_id,
                attempts,
                error,
            } => match policy.next(*attempts, error.as_send_failure(), now) {
                AttemptOutcome::Retry { at } => {
                    sqlx::query(
                        "UPDATE campaign_recipients \
                         SET attempts = $2, next_attempt_at = $3, error_code = $4, error_message = $5, \
                             updated_at = NOW() \
                         WHERE id = $1 AND status = 'pending'",
                    )
                    .bind(recipient_id)
                    .bind(attempts)
                    .bind(at)
                    .bind(error.code())
                    .bind(error.to_string())
                    .execute(&mut *conn)
                    .await?;
                }
                AttemptOutcome::GiveUp => {
                    sqlx::query(
                        "UPDATE campaign_recipients \
                         SET status = 'failed', attempts = $2, failed_at = $3, error_code = $4, \
                             error_message = $5, updated_at = NOW() \
                         WHERE id = $1 AND status = 'pending'",
                    )
                    .bind(recipient_id)
                    .bind(attempts)
                    .bind(now)
                    .bind(error.code())
                    .bind(error.to_string())
                    .execute(&mut *conn)
                    .await?;
                }
            },
            DispatchOutcome::Deferred {
                recipient_id,
                retry_after,
            } => {
                let pause = retry_after.unwrap_or(Duration::seconds(DEFAULT_RATE_LIMIT_PAUSE_SECS));
                sqlx::query(
                    "UPDATE campaign_recipients SET next_attempt_at = $2, updated_at = NOW() \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(recipient_id)
                .bind(now + pause)
                .execute(&mut *conn)
                .await?;
            }
        }
    }
    reapply_parked(conn, &sent_ids).await?;
    Ok(())
}

// ── Worker ──────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct ClaimedCampaign {
    id: Uuid,
    organization_id: Uuid,
    batch_size: i32,
    batch_delay_ms: i32,
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    phone_number_id: Option<String>,
    template_name: String,
    language: String,
    template_status: String,
    template_params: Vec<String>,
}

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let worker_id = Uuid::now_v7();
    let mut interval =
        tokio::time::interval(StdDuration::from_secs(state.config.dispatch_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(worker_id = %worker_id, "campaign dispatcher started");

    loop {
        interval.tick().await;
        if let Err(e) = tick(&state, worker_id).await {
            tracing::error!(error = %e, "campaign dispatcher tick failed");
        }
    }
}

pub async fn tick(state: &AppState, worker_id: Uuid) -> Result<(), sqlx::Error> {
    let promoted = promote_due_campaigns(&state.db).await?;
    if promoted > 0 {
        tracing::info!(promoted, "scheduled campaigns promoted to sending");
    }
    if let Some(claim) = claim_campaign(&state.db, worker_id).await? {
        run_campaign(state, worker_id, claim).await?;
    }
    Ok(())
}

/// Move scheduled campaigns whose time has come to `sending`, materializing
/// their recipients in the same transaction.
pub async fn promote_due_campaigns(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    let due: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM campaigns WHERE status = 'scheduled' AND scheduled_at <= NOW() \
         ORDER BY scheduled_at FOR UPDATE SKIP LOCKED",
    )
    .fetch_all(&mut *tx)
    .await?;

    let next = CampaignStatus::Scheduled
        .transition(CampaignAction::BeginSending)
        .map(CampaignStatus::as_str)
        .unwrap_or("sending");
    for campaign_id in &due {
        let recipients = materialize_recipients(&mut tx, *campaign_id).await?;
        sqlx::query(
            "UPDATE campaigns SET status = $2, started_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(campaign_id)
        .bind(next)
        .execute(&mut *tx)
        .await?;
        recompute_campaign_analytics(&mut tx, *campaign_id).await?;
        tracing::info!(campaign_id = %campaign_id, recipients, "campaign promoted");
    }
    tx.commit().await?;
    Ok(due.len() as u64)
}

async fn claim_campaign(pool: &PgPool, worker_id: Uuid) -> Result<Option<ClaimedCampaign>, sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    let claim = sqlx::query_as::<_, ClaimedCampaign>(
        r#"
        UPDATE campaigns
        SET lease_owner = $1, lease_expires_at = NOW() + make_interval(secs => $2), updated_at = NOW()
        WHERE id = (
            SELECT id FROM campaigns
            WHERE status = 'sending'
              AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
            ORDER BY started_at NULLS FIRST, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, organization_id, batch_size, batch_delay_ms
        "#,
    )
    .bind(worker_id)
    .bind(LEASE_SECS as f64)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(claim)
}

async fn release_lease(conn: &mut PgConnection, campaign_id: Uuid, worker_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE campaigns SET lease_owner = NULL, lease_expires_at = NULL \
         WHERE id = $1 AND lease_owner = $2",
    )
    .bind(campaign_id)
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fail_campaign(pool: &PgPool, campaign_id: Uuid, worker_id: Uuid, reason: &str) -> Result<(), sqlx::Error> {
    let mut tx = begin_service(pool).await?;
    sqlx::query(
        "UPDATE campaigns SET status = 'failed', last_error = $3, lease_owner = NULL, \
             lease_expires_at = NULL, updated_at = NOW() \
         WHERE id = $1 AND lease_owner = $2 AND status = 'sending'",
    )
    .bind(campaign_id)
    .bind(worker_id)
    .bind(reason)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    tracing::warn!(campaign_id = %campaign_id, reason, "campaign failed");
    Ok(())
}

async fn run_campaign(state: &AppState, worker_id: Uuid, claim: ClaimedCampaign) -> Result<(), sqlx::Error> {
    let pool = &state.db;
    let campaign_id = claim.id;
    let plan = BatchPlan::new(Some(claim.batch_size), Some(claim.batch_delay_ms)).unwrap_or_default();
    let policy = RetryPolicy::with_max_attempts(state.config.max_send_attempts);

    let mut tx = begin_service(pool).await?;
    let row = sqlx::query_as::<_, ContextRow>(
        "SELECT o.whatsapp_phone_number_id AS phone_number_id, t.name AS template_name, t.language, \
                t.status AS template_status, c.template_params \
         FROM campaigns c \
         JOIN message_templates t ON t.id = c.template_id \
         JOIN organizations o ON o.id = c.organization_id \
         WHERE c.id = $1",
    )
    .bind(campaign_id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    let Some(phone_number_id) = row.phone_number_id.filter(|id| !id.is_empty()) else {
        return fail_campaign(pool, campaign_id, worker_id, "organization has no WhatsApp phone number").await;
    };
    if !TemplateStatus::parse(&row.template_status).is_ok_and(TemplateStatus::is_sendable) {
        return fail_campaign(pool, campaign_id, worker_id, "template is no longer approved").await;
    }
    let context = DispatchContext {
        phone_number_id,
        template_name: row.template_name,
        language: row.language,
        params: row.template_params,
    };

    tracing::info!(
        campaign_id = %campaign_id,
        organization_id = %claim.organization_id,
        batch_size = plan.batch_size,
        "dispatching campaign"
    );

    loop {
        let mut tx = begin_service(pool).await?;
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM campaigns WHERE id = $1 AND lease_owner = $2",
        )
        .bind(campaign_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        match status.as_deref() {
            Some("sending") => {}
            Some(other) => {
                tracing::info!(campaign_id = %campaign_id, status = other, "campaign left sending; stopping");
                release_lease(&mut tx, campaign_id, worker_id).await?;
                tx.commit().await?;
                return Ok(());
            }
            None => {
                tracing::warn!(campaign_id = %campaign_id, "campaign lease lost");
                tx.commit().await?;
                return Ok(());
            }
        }

        let opted_out = fail_opted_out(&mut tx, campaign_id).await?;
        if opted_out > 0 {
            tracing::info!(campaign_id = %campaign_id, opted_out, "skipped recipients who opted out");
        }
        let batch = due_batch(&mut tx, campaign_id, plan.batch_size).await?;

        if batch.is_empty() {
            let remaining: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM campaign_recipients WHERE campaign_id = $1 AND status = 'pending'",
            )
            .bind(campaign_id)
            .fetch_one(&mut *tx)
            .await?;
            if remaining == 0 {
                finish_dispatch(&mut tx, campaign_id).await?;
            }
            release_lease(&mut tx, campaign_id, worker_id).await?;
            tx.commit().await?;
            return Ok(());
        }
        tx.commit().await?;

        let outcomes = dispatch_batch(state.gateway.as_ref(), &state.send_limiter, &context, &batch).await;
        let sent = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Sent { .. }))
            .count();
        let throttled = outcomes
            .iter()
            .any(|o| matches!(o, DispatchOutcome::Deferred { .. }));

        let mut tx = begin_service(pool).await?;
        persist_outcomes(&mut tx, &outcomes, &policy, Utc::now()).await?;
        recompute_campaign_analytics(&mut tx, campaign_id).await?;
        sqlx::query(
            "UPDATE campaigns SET lease_expires_at = NOW() + make_interval(secs => $3), updated_at = NOW() \
             WHERE id = $1 AND lease_owner = $2",
        )
        .bind(campaign_id)
        .bind(worker_id)
        .bind(LEASE_SECS as f64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            campaign_id = %campaign_id,
            batch = batch.len(),
            sent,
            failed = batch.len() - sent,
            "campaign batch dispatched"
        );

        if throttled {
            tracing::warn!(campaign_id = %campaign_id, "gateway throttled; pausing campaign until next tick");
            let mut tx = begin_service(pool).await?;
            release_lease(&mut tx, campaign_id, worker_id).await?;
            tx.commit().await?;
            return Ok(());
        }

        if !plan.batch_delay.is_zero() {
            tokio::time::sleep(plan.batch_delay).await;
        }
    }
}

/// Every recipient has been attempted: the campaign is `sent`, or `failed`
/// when nothing could be delivered at all.
async fn finish_dispatch(conn: &mut PgConnection, campaign_id: Uuid) -> Result<(), sqlx::Error> {
    let stats = recompute_campaign_analytics(&mut *conn, campaign_id).await?;
    let counts = stats.counts;
    let (action, reason) = if counts.total == 0 {
        (CampaignAction::Fail, Some("no eligible recipients"))
    } else if counts.all_failed() {
        (CampaignAction::Fail, Some("every recipient failed"))
    } else {
        (CampaignAction::FinishDispatch, None)
    };
    let next = match CampaignStatus::Sending.transition(action) {
        Ok(next) => next,
        Err(e) => {
            tracing::error!(campaign_id = %campaign_id, error = %e, "unexpected campaign transition");
            return Ok(());
        }
    };
    sqlx::query(
        "UPDATE campaigns SET status = $2, dispatched_at = NOW(), last_error = $3, updated_at = NOW() \
         WHERE id = $1 AND status = 'sending'",
    )
    .bind(campaign_id)
    .bind(next.as_str())
    .bind(reason)
    .execute(&mut *conn)
    .await?;
    tracing::info!(
        campaign_id = %campaign_id,
        status = next.as_str(),
        total = counts.total,
        failed = counts.failed,
        "campaign dispatch finished"
    );
    Ok(())
}
