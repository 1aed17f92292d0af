//! Webhook ingest: applies gateway notifications to recipients, messages,
//! conversations and templates.
//!
//! Every stored webhook event is processed in a single service-role
//! transaction. Processing is idempotent, so a stored event can be replayed:
//! inbound messages are keyed by provider message id and delivery statuses
//! only ever move forward (`delivery_advances()` guards each UPDATE).
//! A status for a message id not stored yet is parked and applied once the
//! sender or the reply path records that id.
//!
//! Lock order for every writer: recipient rows, then `campaign_analytics`,
//! then the `campaigns` row.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use engage_core::analytics::should_complete;
use engage_core::campaigns::{CampaignAction, CampaignStatus};
use engage_core::contacts::normalize_phone;
use engage_core::delivery::RecipientStatus;
use engage_core::webhook::{
    InboundMessage, OptKeyword, StatusUpdate, TemplateStatusUpdate, WebhookPayload, opt_keyword,
};
use engage_core::window::{ConversationStatus, WindowState};

use crate::analytics::recompute_campaign_analytics;
use crate::db::begin_service;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub statuses_applied: u64,
    pub statuses_ignored: u64,
    pub statuses_parked: u64,
    pub inbound_stored: u64,
    pub templates_updated: u64,
    pub campaigns_completed: u64,
}

/// Store a raw delivery in the webhook inbox. Returns `None` when the exact
/// same body was already received.
pub async fn record_event(
    pool: &PgPool,
    digest: &str,
    payload: &serde_json::Value,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO webhook_events (id, payload_hash, payload) VALUES ($1, $2, $3) \
         ON CONFLICT (payload_hash) DO NOTHING RETURNING id",
    )
    .bind(Uuid::now_v7())
    .bind(digest)
    .bind(payload)
    .fetch_optional(pool)
    .await
}

/// Keep a processing error on an inbox row without touching anything else.
pub async fn mark_failed(pool: &PgPool, event_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE webhook_events SET attempts = attempts + 1, error = $2 WHERE id = $1")
        .bind(event_id)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}

/// Process a stored event and record the outcome on its inbox row. Failures
/// are kept on the row for a later replay rather than propagated.
pub async fn process_event(
    pool: &PgPool,
    event_id: Uuid,
    payload: &WebhookPayload,
    completion_grace: Duration,
) -> Result<IngestReport, sqlx::Error> {
    let result = apply_payload(pool, payload, Utc::now(), completion_grace).await;

    let error = result.as_ref().err().map(|e| e.to_string());
    sqlx::query(
        "UPDATE webhook_events \
         SET attempts = attempts + 1, \
             processed_at = CASE WHEN $2::text IS NULL THEN NOW() ELSE processed_at END, \
             error = $2 \
         WHERE id = $1",
    )
    .bind(event_id)
    .bind(&error)
    .execute(pool)
    .await?;

    match &result {
        Ok(report) => tracing::info!(
            event_id = %event_id,
            statuses_applied = report.statuses_applied,
            statuses_ignored = report.statuses_ignored,
            statuses_parked = report.statuses_parked,
            inbound_stored = report.inbound_stored,
            templates_updated = report.templates_updated,
            campaigns_completed = report.campaigns_completed,
            "webhook event processed"
        ),
        Err(e) => tracing::error!(event_id = %event_id, error = %e, "webhook event processing failed"),
    }
    result
}

pub async fn apply_payload(
    pool: &PgPool,
    payload: &WebhookPayload,
    received_at: DateTime<Utc>,
    completion_grace: Duration,
) -> Result<IngestReport, sqlx::Error> {
    let events = payload.events();
    let mut report = IngestReport::default();
    let mut tx = begin_service(pool).await?;

    // Concurrent deliveries lock recipient rows in provider id order. The
    // sort is stable, so updates for one message keep their payload order.
    let mut statuses: Vec<&StatusUpdate> = events.statuses.iter().collect();
    statuses.sort_by(|a, b| a.provider_message_id.cmp(&b.provider_message_id));

    let mut touched_campaigns = BTreeSet::new();
    for update in statuses {
        match apply_status(&mut tx, update, received_at).await? {
            StatusApplied::Advanced(campaign_id) => {
                report.statuses_applied += 1;
                touched_campaigns.extend(campaign_id);
            }
            StatusApplied::Stale => report.statuses_ignored += 1,
            StatusApplied::Parked => report.statuses_parked += 1,
        }
    }
    for campaign_id in touched_campaigns {
        if refresh_campaign(&mut tx, campaign_id, received_at, completion_grace).await? {
            report.campaigns_completed += 1;
        }
    }

    for message in &events.inbound {
        if apply_inbound(&mut tx, message, received_at).await? {
            report.inbound_stored += 1;
        }
    }

    for update in &events.template_updates {
        report.templates_updated += apply_template_update(&mut tx, update).await?;
    }

    tx.commit().await?;
    Ok(report)
}

const STATUS_COLUMNS: &str = "\
    status = $2, \
    sent_at = CASE WHEN $2 <> 'failed' THEN COALESCE(sent_at, $3) ELSE sent_at END, \
    delivered_at = CASE WHEN $2 IN ('delivered', 'read') THEN COALESCE(delivered_at, $3) ELSE delivered_at END, \
    read_at = CASE WHEN $2 = 'read' THEN COALESCE(read_at, $3) ELSE read_at END, \
    failed_at = CASE WHEN $2 = 'failed' THEN COALESCE(failed_at, $3) ELSE failed_at END, \
    error_code = CASE WHEN $2 = 'failed' THEN $4 ELSE error_code END, \
    error_message = CASE WHEN $2 = 'failed' THEN $5 ELSE error_message END";

const PARKED_COLUMNS: &str = "provider_message_id, status, occurred_at, error_code, error_message";

/// One delivery status as written to recipients, messages or the parking table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
struct StatusRow {
    provider_message_id: String,
    status: String,
    occurred_at: DateTime<Utc>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl StatusRow {
    fn from_update(update: &StatusUpdate, received_at: DateTime<Utc>) -> Self {
        Self {
            provider_message_id: update.provider_message_id.clone(),
            status: update.status.as_str().to_string(),
            occurred_at: update.occurred_at.unwrap_or(received_at),
            error_code: update.error.as_ref().and_then(|e| e.code).map(|c| c.to_string()),
            error_message: update
                .error
                .as_ref()
                .and_then(|e| e.title.clone().or_else(|| e.message.clone())),
        }
    }

    fn rank(&self) -> i16 {
        RecipientStatus::parse(&self.status).map_or(i16::MAX, RecipientStatus::rank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusApplied {
    /// A stored recipient or message moved forward.
    Advanced(Option<Uuid>),
    /// The message is known but the update is not an advance.
    Stale,
    /// The message is not stored yet; the update waits in `parked_statuses`.
    Parked,
}

async fn apply_status(
    conn: &mut PgConnection,
    update: &StatusUpdate,
    received_at: DateTime<Utc>,
) -> Result<StatusApplied, sqlx::Error> {
    let row = StatusRow::from_update(update, received_at);
    let (advanced, campaign_id) = write_status(&mut *conn, &row).await?;
    if advanced {
        return Ok(StatusApplied::Advanced(campaign_id));
    }

    let known: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM campaign_recipients WHERE provider_message_id = $1) \
             OR EXISTS (SELECT 1 FROM messages WHERE provider_message_id = $1)",
    )
    .bind(&row.provider_message_id)
    .fetch_one(&mut *conn)
    .await?;
    if known {
        tracing::debug!(
            provider_message_id = %row.provider_message_id,
            status = %row.status,
            "status update ignored (not an advance)"
        );
        return Ok(StatusApplied::Stale);
    }

    sqlx::query(&format!(
        "INSERT INTO parked_statuses ({PARKED_COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (provider_message_id, status) DO NOTHING"
    ))
    .bind(&row.provider_message_id)
    .bind(&row.status)
    .bind(row.occurred_at)
    .bind(&row.error_code)
    .bind(&row.error_message)
    .execute(&mut *conn)
    .await?;
    tracing::debug!(
        provider_message_id = %row.provider_message_id,
        status = %row.status,
        "status update parked until the message is stored"
    );
    Ok(StatusApplied::Parked)
}

/// Guarded write of one status. Returns whether any row advanced, and the
/// campaign of the matched recipient.
async fn write_status(
    conn: &mut PgConnection,
    row: &StatusRow,
) -> Result<(bool, Option<Uuid>), sqlx::Error> {
    let campaign_id: Option<Uuid> = sqlx::query_scalar(&format!(
        "UPDATE campaign_recipients SET {STATUS_COLUMNS}, updated_at = NOW() \
         WHERE provider_message_id = $1 AND delivery_advances(status, $2) \
         RETURNING campaign_id"
    ))
    .bind(&row.provider_message_id)
    .bind(&row.status)
    .bind(row.occurred_at)
    .bind(&row.error_code)
    .bind(&row.error_message)
    .fetch_optional(&mut *conn)
    .await?;

    let messages = sqlx::query(&format!(
        "UPDATE messages SET {STATUS_COLUMNS} \
         WHERE provider_message_id = $1 AND delivery_advances(status, $2)"
    ))
    .bind(&row.provider_message_id)
    .bind(&row.status)
    .bind(row.occurred_at)
    .bind(&row.error_code)
    .bind(&row.error_message)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok((campaign_id.is_some() || messages > 0, campaign_id))
}

/// Parked statuses that were applied, and the campaigns they touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParkedReplay {
    pub applied: u64,
    pub campaigns: BTreeSet<Uuid>,
}

/// Apply and drop the parked statuses of messages that were just stored.
/// Called in the same transaction that writes their provider message ids.
pub async fn reapply_parked(
    conn: &mut PgConnection,
    provider_message_ids: &[String],
) -> Result<ParkedReplay, sqlx::Error> {
    if provider_message_ids.is_empty() {
        return Ok(ParkedReplay::default());
    }
    let rows = sqlx::query_as::<_, StatusRow>(&format!(
        "DELETE FROM parked_statuses WHERE provider_message_id = ANY($1) RETURNING {PARKED_COLUMNS}"
    ))
    .bind(provider_message_ids)
    .fetch_all(&mut *conn)
    .await?;
    apply_parked(conn, rows).await
}

/// Sweep parked statuses whose message has since been stored. Covers the
/// case where the webhook committed its parked row after the sender's
/// `reapply_parked` had already run.
pub async fn reconcile_parked(conn: &mut PgConnection) -> Result<ParkedReplay, sqlx::Error> {
    let rows = sqlx::query_as::<_, StatusRow>(&format!(
        "DELETE FROM parked_statuses p \
         WHERE EXISTS (SELECT 1 FROM campaign_recipients r WHERE r.provider_message_id = p.provider_message_id) \
            OR EXISTS (SELECT 1 FROM messages m WHERE m.provider_message_id = p.provider_message_id) \
         RETURNING {PARKED_COLUMNS}"
    ))
    .fetch_all(&mut *conn)
    .await?;
    apply_parked(conn, rows).await
}

/// Drop parked statuses that never found their message.
pub async fn purge_parked(conn: &mut PgConnection, older_than: Duration) -> Result<u64, sqlx::Error> {
    let purged = sqlx::query("DELETE FROM parked_statuses WHERE received_at < $1")
        .bind(Utc::now() - older_than)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(purged)
}

/// Per message, earlier statuses first, so each one still advances.
fn sort_for_replay(rows: &mut [StatusRow]) {
    rows.sort_by(|a, b| {
        a.provider_message_id
            .cmp(&b.provider_message_id)
            .then(a.rank().cmp(&b.rank()))
    });
}

async fn apply_parked(
    conn: &mut PgConnection,
    mut rows: Vec<StatusRow>,
) -> Result<ParkedReplay, sqlx::Error> {
    sort_for_replay(&mut rows);
    let mut replay = ParkedReplay::default();
    for row in &rows {
        let (advanced, campaign_id) = write_status(&mut *conn, row).await?;
        if advanced {
            replay.applied += 1;
            replay.campaigns.extend(campaign_id);
        }
    }
    if !rows.is_empty() {
        tracing::info!(parked = rows.len(), applied = replay.applied, "parked statuses applied");
    }
    Ok(replay)
}

#[derive(sqlx::FromRow)]
struct CampaignProgressRow {
    status: String,
    dispatched_at: Option<DateTime<Utc>>,
}

/// Recompute analytics and complete a `sent` campaign once it has settled.
/// Takes the analytics row before the campaign row, like every other writer.
pub async fn refresh_campaign(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    now: DateTime<Utc>,
    completion_grace: Duration,
) -> Result<bool, sqlx::Error> {
    let stats = recompute_campaign_analytics(&mut *conn, campaign_id).await?;
    let Some(row) = sqlx::query_as::<_, CampaignProgressRow>(
        "SELECT status, dispatched_at FROM campaigns WHERE id = $1",
    )
    .bind(campaign_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(false);
    };

    let Ok(status) = CampaignStatus::parse(&row.status) else {
        return Ok(false);
    };
    if !should_complete(status, &stats.counts, row.dispatched_at, now, completion_grace) {
        return Ok(false);
    }
    let Ok(next) = status.transition(CampaignAction::Complete) else {
        return Ok(false);
    };
    let completed = sqlx::query(
        "UPDATE campaigns SET status = $2, completed_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status = 'sent'",
    )
    .bind(campaign_id)
    .bind(next.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if completed > 0 {
        tracing::info!(campaign_id = %campaign_id, total = stats.counts.total, "campaign completed");
    }
    Ok(completed > 0)
}

#[derive(sqlx::FromRow)]
struct ContactUpsertRow {
    id: Uuid,
}

#[derive(sqlx::FromRow)]
struct ConversationWindowRow {
    id: Uuid,
    status: String,
    last_inbound_at: Option<DateTime<Utc>>,
    window_expires_at: Option<DateTime<Utc>>,
}

impl ConversationWindowRow {
    fn window(&self) -> WindowState {
        WindowState {
            status: ConversationStatus::parse(&self.status).unwrap_or(ConversationStatus::Open),
            last_inbound_at: self.last_inbound_at,
            window_expires_at: self.window_expires_at,
        }
    }
}

/// Store one inbound customer message. Returns false for duplicates and for
/// messages to a number no organization owns.
async fn apply_inbound(
    conn: &mut PgConnection,
    message: &InboundMessage,
    received_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let Some(phone_number_id) = message.phone_number_id.as_deref() else {
        tracing::warn!(provider_message_id = %message.provider_message_id, "inbound message without phone_number_id");
        return Ok(false);
    };
    let organization_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM organizations WHERE whatsapp_phone_number_id = $1",
    )
    .bind(phone_number_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(organization_id) = organization_id else {
        tracing::warn!(phone_number_id, "inbound message for unknown phone number");
        return Ok(false);
    };
    let phone = match normalize_phone(&message.from) {
        Ok(phone) => phone,
        Err(e) => {
            tracing::warn!(from = %message.from, error = %e, "inbound message from unparseable number");
            return Ok(false);
        }
    };
    let at = message.occurred_at.unwrap_or(received_at);

    let contact = sqlx::query_as::<_, ContactUpsertRow>(
        "INSERT INTO contacts (id, organization_id, phone_e164, name) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (organization_id, phone_e164) DO UPDATE \
         SET name = COALESCE(NULLIF(contacts.name, ''), EXCLUDED.name), updated_at = NOW() \
         RETURNING id",
    )
    .bind(Uuid::now_v7())
    .bind(organization_id)
    .bind(&phone)
    .bind(&message.profile_name)
    .fetch_one(&mut *conn)
    .await?;

    let conversation = live_conversation(conn, organization_id, contact.id).await?;

    let inserted: Option<Uuid> = sqlx::query_scalar(
        "INSERT INTO messages (id, organization_id, conversation_id, direction, kind, body, \
                               provider_message_id, status, created_at) \
         VALUES ($1, $2, $3, 'inbound', $4, $5, $6, 'delivered', $7) \
         ON CONFLICT (provider_message_id) DO NOTHING RETURNING id",
    )
    .bind(Uuid::now_v7())
    .bind(organization_id)
    .bind(conversation.id)
    .bind(&message.kind)
    .bind(&message.body)
    .bind(&message.provider_message_id)
    .bind(at)
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_none() {
        tracing::debug!(provider_message_id = %message.provider_message_id, "duplicate inbound message");
        return Ok(false);
    }

    let mut window = conversation.window();
    window.on_inbound(at);
    sqlx::query(
        "UPDATE conversations \
         SET status = $2, last_inbound_at = $3, window_expires_at = $4, \
             last_message_at = GREATEST(last_message_at, $5), updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(conversation.id)
    .bind(window.status.as_str())
    .bind(window.last_inbound_at)
    .bind(window.window_expires_at)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    if let Some(keyword) = message.body.as_deref().and_then(opt_keyword) {
        let opted_out = keyword == OptKeyword::OptOut;
        sqlx::query(
            "UPDATE contacts SET opted_out = $2, \
                 opted_out_at = CASE WHEN $2 THEN NOW() ELSE NULL END, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(contact.id)
        .bind(opted_out)
        .execute(&mut *conn)
        .await?;
        tracing::info!(contact_id = %contact.id, opted_out, "contact opt-in status changed by keyword");
    }

    Ok(true)
}

/// The contact's conversation that is not closed, created when missing.
async fn live_conversation(
    conn: &mut PgConnection,
    organization_id: Uuid,
    contact_id: Uuid,
) -> Result<ConversationWindowRow, sqlx::Error> {
    sqlx::query(
        "INSERT INTO conversations (id, organization_id, contact_id, status) VALUES ($1, $2, $3, 'open') \
         ON CONFLICT (organization_id, contact_id) WHERE status <> 'closed' DO NOTHING",
    )
    .bind(Uuid::now_v7())
    .bind(organization_id)
    .bind(contact_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query_as::<_, ConversationWindowRow>(
        "SELECT id, status, last_inbound_at, window_expires_at FROM conversations \
         WHERE organization_id = $1 AND contact_id = $2 AND status <> 'closed' \
         FOR UPDATE",
    )
    .bind(organization_id)
    .bind(contact_id)
    .fetch_one(&mut *conn)
    .await
}

async fn apply_template_update(
    conn: &mut PgConnection,
    update: &TemplateStatusUpdate,
) -> Result<u64, sqlx::Error> {
    let status = update.status.as_str();
    if let Some(provider_id) = &update.provider_template_id {
        let updated = sqlx::query(
            "UPDATE message_templates SET status = $2, rejection_reason = $3, updated_at = NOW() \
             WHERE provider_template_id = $1",
        )
        .bind(provider_id)
        .bind(status)
        .bind(&update.reason)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if updated > 0 {
            return Ok(updated);
        }
    }

    let (Some(name), Some(language)) = (&update.name, &update.language) else {
        return Ok(0);
    };
    let updated = sqlx::query(
        "UPDATE message_templates \
         SET status = $3, rejection_reason = $4, \
             provider_template_id = COALESCE(provider_template_id, $5), updated_at = NOW() \
         WHERE name = $1 AND language = $2 AND provider_template_id IS NULL",
    )
    .bind(name)
    .bind(language)
    .bind(status)
    .bind(&update.reason)
    .bind(&update.provider_template_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        tracing::warn!(template = %name, language = %language, "template status update matched nothing");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stored_conversation_feeds_the_window_state() {
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let row = ConversationWindowRow {
            id: Uuid::now_v7(),
            status: "expired".to_string(),
            last_inbound_at: Some(last),
            window_expires_at: Some(last + Duration::hours(24)),
        };
        let mut window = row.window();
        assert_eq!(window.status, ConversationStatus::Expired);

        let later = last + Duration::hours(30);
        window.on_inbound(later);
        assert_eq!(window.status, ConversationStatus::Open);
        assert_eq!(window.window_expires_at, Some(later + Duration::hours(24)));
    }

    #[test]
    fn delivery_rank_function_matches_recipient_rank() {
        let schema = include_str!("../../migrations/0001_init.sql");
        let body = schema
            .split("CREATE FUNCTION delivery_rank")
            .nth(1)
            .and_then(|rest| rest.split("$$").nth(1))
            .expect("delivery_rank body");
        for status in RecipientStatus::ALL {
            let arm = format!("WHEN '{}' THEN {}", status.as_str(), status.rank());
            assert!(body.contains(&arm), "missing `{arm}` in delivery_rank()");
        }
    }

    #[test]
    fn parked_rows_apply_in_delivery_order() {
        let row = |id: &str, status: &str| StatusRow {
            provider_message_id: id.to_string(),
            status: status.to_string(),
            occurred_at: Utc::now(),
            error_code: None,
            error_message: None,
        };
        let mut rows = vec![
            row("wamid.B", "read"),
            row("wamid.A", "read"),
            row("wamid.B", "sent"),
            row("wamid.A", "delivered"),
        ];
        sort_for_replay(&mut rows);
        let order: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.provider_message_id.as_str(), r.status.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("wamid.A", "delivered"), ("wamid.A", "read"), ("wamid.B", "sent"), ("wamid.B", "read")]
        );
    }

    mod with_database {
        use super::*;
        use crate::db::testing::{add_recipient, campaign_fixture, db_pool_if_available, load_recipient};
        use engage_core::delivery::Transition;

        fn update(provider_message_id: &str, status: RecipientStatus) -> StatusUpdate {
            StatusUpdate {
                phone_number_id: Some("PN1".to_string()),
                provider_message_id: provider_message_id.to_string(),
                status,
                occurred_at: None,
                recipient: None,
                error: None,
            }
        }

        #[tokio::test]
        async fn sql_guard_matches_recipient_status_transitions() {
            let Some(pool) = db_pool_if_available().await else {
                return;
            };
            for current in RecipientStatus::ALL {
                for next in RecipientStatus::ALL {
                    let advances: bool = sqlx::query_scalar("SELECT delivery_advances($1, $2)")
                        .bind(current.as_str())
                        .bind(next.as_str())
                        .fetch_one(&pool)
                        .await
                        .unwrap();
                    assert_eq!(
                        advances,
                        current.apply(next) == Transition::Advance,
                        "{current:?} -> {next:?}"
                    );
                }
            }
        }

        #[tokio::test]
        async fn read_before_delivered_backfills_delivered_at() {
            let Some(pool) = db_pool_if_available().await else {
                return;
            };
            let fixture = campaign_fixture(&pool, "sent").await;
            let wamid = format!("wamid.{}", Uuid::now_v7());
            let (_, recipient_id) = add_recipient(&pool, &fixture, "sent", Some(wamid.as_str())).await;

            let mut tx = begin_service(&pool).await.unwrap();
            let applied = apply_status(&mut tx, &update(&wamid, RecipientStatus::Read), Utc::now())
                .await
                .unwrap();
            assert_eq!(applied, StatusApplied::Advanced(Some(fixture.campaign_id)));
            let late = apply_status(&mut tx, &update(&wamid, RecipientStatus::Delivered), Utc::now())
                .await
                .unwrap();
            assert_eq!(late, StatusApplied::Stale);
            tx.commit().await.unwrap();

            let row = load_recipient(&pool, recipient_id).await;
            assert_eq!(row.status, "read");
            assert!(row.read_at.is_some());
            assert_eq!(row.delivered_at, row.read_at);
        }

        #[tokio::test]
        async fn unknown_message_status_is_parked_once() {
            let Some(pool) = db_pool_if_available().await else {
                return;
            };
            let wamid = format!("wamid.{}", Uuid::now_v7());

            let mut tx = begin_service(&pool).await.unwrap();
            for _ in 0..2 {
                let applied = apply_status(&mut tx, &update(&wamid, RecipientStatus::Delivered), Utc::now())
                    .await
                    .unwrap();
                assert_eq!(applied, StatusApplied::Parked);
            }
            let parked: i64 =
                sqlx::query_scalar("SELECT count(*) FROM parked_statuses WHERE provider_message_id = $1")
                    .bind(&wamid)
                    .fetch_one(&mut *tx)
                    .await
                    .unwrap();
            tx.rollback().await.unwrap();
            assert_eq!(parked, 1);
        }
    }
}
