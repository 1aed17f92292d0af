use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use utoipa::ToSchema;
use uuid::Uuid;

use engage_core::analytics::{CampaignStats, StatusCounts};
use engage_core::delivery::RecipientStatus;

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    status: String,
    n: i64,
}

/// Rebuild a campaign's aggregate row from its recipients. Safe to call any
/// number of times and from concurrent webhook deliveries: the row is always
/// derived from scratch and upserted.
pub async fn recompute_campaign_analytics(
    conn: &mut PgConnection,
    campaign_id: Uuid,
) -> Result<CampaignStats, sqlx::Error> {
    let rows = sqlx::query_as::<_, StatusCountRow>(
        "SELECT status, count(*) AS n FROM campaign_recipients WHERE campaign_id = $1 GROUP BY status",
    )
    .bind(campaign_id)
    .fetch_all(&mut *conn)
    .await?;

    let counts = StatusCounts::from_pairs(rows.into_iter().filter_map(|row| {
        match RecipientStatus::parse(&row.status) {
            Ok(status) => Some((status, row.n)),
            Err(_) => {
                tracing::warn!(campaign_id = %campaign_id, status = %row.status, "unknown recipient status");
                None
            }
        }
    }));
    let stats = CampaignStats::from_counts(counts);

    sqlx::query(
        r#"
        INSERT INTO campaign_analytics (
            campaign_id, organization_id, total, pending, sent, delivered, read, failed,
            delivery_rate, read_rate, failure_rate, updated_at
        )
        SELECT c.id, c.organization_id, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW()
        FROM campaigns c WHERE c.id = $1
        ON CONFLICT (campaign_id) DO UPDATE SET
            total = EXCLUDED.total,
            pending = EXCLUDED.pending,
            sent = EXCLUDED.sent,
            delivered = EXCLUDED.delivered,
            read = EXCLUDED.read,
            failed = EXCLUDED.failed,
            delivery_rate = EXCLUDED.delivery_rate,
            read_rate = EXCLUDED.read_rate,
            failure_rate = EXCLUDED.failure_rate,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(campaign_id)
    .bind(counts.total)
    .bind(counts.pending)
    .bind(counts.sent)
    .bind(counts.delivered)
    .bind(counts.read)
    .bind(counts.failed)
    .bind(stats.delivery_rate)
    .bind(stats.read_rate)
    .bind(stats.failure_rate)
    .execute(&mut *conn)
    .await?;

    Ok(stats)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CampaignAnalyticsResponse {
    pub campaign_id: Uuid,
    #[serde(flatten)]
    pub stats: CampaignStats,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub struct CampaignAnalyticsRow {
    pub campaign_id: Uuid,
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub failed: i64,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub failure_rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl CampaignAnalyticsRow {
    pub fn into_response(self) -> CampaignAnalyticsResponse {
        CampaignAnalyticsResponse {
            campaign_id: self.campaign_id,
            stats: CampaignStats {
                counts: StatusCounts {
                    total: self.total,
                    pending: self.pending,
                    sent: self.sent,
                    delivered: self.delivered,
                    read: self.read,
                    failed: self.failed,
                },
                delivery_rate: self.delivery_rate,
                read_rate: self.read_rate,
                failure_rate: self.failure_rate,
            },
            updated_at: self.updated_at,
        }
    }
}

pub async fn load_campaign_analytics(
    conn: &mut PgConnection,
    campaign_id: Uuid,
) -> Result<Option<CampaignAnalyticsRow>, sqlx::Error> {
    sqlx::query_as::<_, CampaignAnalyticsRow>(
        "SELECT campaign_id, total, pending, sent, delivered, read, failed, \
                delivery_rate, read_rate, failure_rate, updated_at \
         FROM campaign_analytics WHERE campaign_id = $1",
    )
    .bind(campaign_id)
    .fetch_optional(&mut *conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_row_serializes_flat() {
        let row = CampaignAnalyticsRow {
            campaign_id: Uuid::nil(),
            total: 10,
            pending: 0,
            sent: 2,
            delivered: 5,
            read: 2,
            failed: 1,
            delivery_rate: 0.7,
            read_rate: 0.2,
            failure_rate: 0.1,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(row.into_response()).unwrap();
        assert_eq!(json["total"], 10);
        assert_eq!(json["delivered"], 5);
        assert_eq!(json["delivery_rate"], 0.7);
        assert!(json.get("counts").is_none());
        assert!(json.get("stats").is_none());
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        use crate::db::begin_service;
        use crate::db::testing::{add_recipient, campaign_fixture, db_pool_if_available};

        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        let fixture = campaign_fixture(&pool, "sent").await;
        for status in ["sent", "delivered", "read", "failed"] {
            let wamid = format!("wamid.{}", Uuid::now_v7());
            add_recipient(&pool, &fixture, status, Some(wamid.as_str())).await;
        }

        let mut tx = begin_service(&pool).await.unwrap();
        let first = recompute_campaign_analytics(&mut tx, fixture.campaign_id).await.unwrap();
        let second = recompute_campaign_analytics(&mut tx, fixture.campaign_id).await.unwrap();
        let stored = load_campaign_analytics(&mut tx, fixture.campaign_id)
            .await
            .unwrap()
            .expect("analytics row");
        let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM campaign_analytics WHERE campaign_id = $1")
            .bind(fixture.campaign_id)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(rows, 1);
        assert_eq!(stored.total, 4);
        assert_eq!(stored.delivered, 1);
        assert_eq!(stored.read, 1);
        assert_eq!(stored.failed, 1);
        assert_eq!(stored.delivery_rate, second.delivery_rate);
    }
}
