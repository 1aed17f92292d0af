//! Transaction helpers carrying the row-level-security context.
//!
//! Tenant tables are guarded by policies on `engage.current_org_id`; the
//! workers and webhook ingest act across organizations and instead set
//! `engage.service_role`. Both settings are transaction-local.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub type Tx = Transaction<'static, Postgres>;

pub async fn begin_tenant(pool: &PgPool, organization_id: Uuid) -> Result<Tx, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('engage.current_org_id', $1, true)")
        .bind(organization_id.to_string())
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

pub async fn begin_service(pool: &PgPool) -> Result<Tx, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('engage.service_role', 'on', true)")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Fixtures for tests that need a real Postgres. Every helper returns early
/// with `None` when `DATABASE_URL` is unset, so the suite still passes
/// without a database. Rows are keyed by fresh UUIDs, so tests can share one
/// database and run concurrently.
#[cfg(test)]
pub mod testing {
    use sqlx::PgPool;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    use super::begin_service;

    pub async fn db_pool_if_available() -> Option<PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");
        Some(pool)
    }

    pub struct CampaignFixture {
        pub organization_id: Uuid,
        pub campaign_id: Uuid,
    }

    /// An organization with an approved template and one campaign in `status`.
    pub async fn campaign_fixture(pool: &PgPool, status: &str) -> CampaignFixture {
        let organization_id = Uuid::now_v7();
        let template_id = Uuid::now_v7();
        let campaign_id = Uuid::now_v7();
        let mut tx = begin_service(pool).await.expect("service tx");
        sqlx::query("INSERT INTO organizations (id, name, whatsapp_phone_number_id) VALUES ($1, 'Test Org', $2)")
            .bind(organization_id)
            .bind(format!("pn-{organization_id}"))
            .execute(&mut *tx)
            .await
            .expect("insert organization");
        sqlx::query(
            "INSERT INTO message_templates (id, organization_id, name, language, category, body, status) \
             VALUES ($1, $2, 'spring_sale', 'en', 'marketing', 'Hello!', 'approved')",
        )
        .bind(template_id)
        .bind(organization_id)
        .execute(&mut *tx)
        .await
        .expect("insert template");
        sqlx::query(
            "INSERT INTO campaigns (id, organization_id, name, template_id, status, started_at, dispatched_at) \
             VALUES ($1, $2, 'Spring sale', $3, $4, NOW(), \
                     CASE WHEN $4 IN ('sent', 'completed') THEN NOW() END)",
        )
        .bind(campaign_id)
        .bind(organization_id)
        .bind(template_id)
        .bind(status)
        .execute(&mut *tx)
        .await
        .expect("insert campaign");
        tx.commit().await.expect("commit fixture");
        CampaignFixture {
            organization_id,
            campaign_id,
        }
    }

    /// A contact and its recipient row. Returns `(contact_id, recipient_id)`.
    pub async fn add_recipient(
        pool: &PgPool,
        fixture: &CampaignFixture,
        status: &str,
        provider_message_id: Option<&str>,
    ) -> (Uuid, Uuid) {
        let contact_id = Uuid::now_v7();
        let recipient_id = Uuid::now_v7();
        let phone = format!("+1555{:07}", contact_id.as_u128() % 10_000_000);
        let mut tx = begin_service(pool).await.expect("service tx");
        sqlx::query("INSERT INTO contacts (id, organization_id, phone_e164) VALUES ($1, $2, $3)")
            .bind(contact_id)
            .bind(fixture.organization_id)
            .bind(&phone)
            .execute(&mut *tx)
            .await
            .expect("insert contact");
        sqlx::query(
            "INSERT INTO campaign_recipients \
                 (id, campaign_id, organization_id, contact_id, phone_e164, status, provider_message_id, \
                  sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, CASE WHEN $6 <> 'pending' THEN NOW() END)",
        )
        .bind(recipient_id)
        .bind(fixture.campaign_id)
        .bind(fixture.organization_id)
        .bind(contact_id)
        .bind(&phone)
        .bind(status)
        .bind(provider_message_id)
        .execute(&mut *tx)
        .await
        .expect("insert recipient");
        tx.commit().await.expect("commit fixture");
        (contact_id, recipient_id)
    }

    #[derive(Debug, sqlx::FromRow)]
    pub struct RecipientRow {
        pub status: String,
        pub attempts: i32,
        pub error_code: Option<String>,
        pub next_attempt_at: chrono::DateTime<chrono::Utc>,
        pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
        pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    }

    pub async fn load_recipient(pool: &PgPool, recipient_id: Uuid) -> RecipientRow {
        let mut tx = begin_service(pool).await.expect("service tx");
        let row = sqlx::query_as::<_, RecipientRow>(
            "SELECT status, attempts, error_code, next_attempt_at, delivered_at, read_at \
             FROM campaign_recipients WHERE id = $1",
        )
        .bind(recipient_id)
        .fetch_one(&mut *tx)
        .await
        .expect("load recipient");
        tx.commit().await.expect("commit");
        row
    }

    pub async fn campaign_status(pool: &PgPool, campaign_id: Uuid) -> String {
        let mut tx = begin_service(pool).await.expect("service tx");
        let status: String = sqlx::query_scalar("SELECT status FROM campaigns WHERE id = $1")
            .bind(campaign_id)
            .fetch_one(&mut *tx)
            .await
            .expect("load campaign");
        tx.commit().await.expect("commit");
        status
    }
}
