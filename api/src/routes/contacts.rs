use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::contacts::{normalize_phone, normalize_tags};
use engage_core::pagination::{PaginatedResponse, clamp_limit, decode_cursor};
use engage_core::roles::Permission;

use crate::auth::AuthenticatedUser;
use crate::db::begin_tenant;
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery, nullable};
use crate::state::AppState;

pub const MAX_BATCH_CONTACTS: usize = 500;

#[derive(Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ContactResponse {
    pub id: Uuid,
    pub phone_e164: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub tags: Vec<String>,
    #[schema(value_type = Object)]
    pub attributes: serde_json::Value,
    pub opted_out: bool,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateContactRequest {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub attributes: Option<serde_json::Value>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateContactRequest {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[schema(value_type = Option<String>)]
    pub email: Option<Option<String>>,
    /// Replaces the tag set.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Merged into the stored attributes; keys set to `null` are kept as null.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub attributes: Option<serde_json::Value>,
    #[serde(default)]
    pub opted_out: Option<bool>,
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct BatchContactsRequest {
    pub contacts: Vec<CreateContactRequest>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct BatchContactError {
    pub index: usize,
    pub field: String,
    pub message: String,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct BatchContactsResponse {
    pub created: u64,
    pub updated: u64,
    pub rejected: Vec<BatchContactError>,
}

#[derive(Deserialize, utoipa::IntoParams)]
pub struct ListContactsParams {
    /// Case-insensitive match on name or phone number
    pub q: Option<String>,
    /// Only contacts carrying this tag
    pub tag: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

const CONTACT_COLUMNS: &str = "id, phone_e164, name, email, tags, attributes, opted_out, opted_out_at, created_at, updated_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/contacts", get(list_contacts).post(create_contact))
        .route("/v1/contacts/batch", post(batch_upsert_contacts))
        .route(
            "/v1/contacts/{id}",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
}

/// A contact write after normalization.
struct ContactInput {
    phone_e164: String,
    name: Option<String>,
    email: Option<String>,
    tags: Vec<String>,
    attributes: serde_json::Value,
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_attributes(attributes: Option<serde_json::Value>) -> Result<serde_json::Value, AppError> {
    match attributes {
        None => Ok(serde_json::json!({})),
        Some(value @ serde_json::Value::Object(_)) => Ok(value),
        Some(other) => Err(AppError::Validation {
            message: "attributes must be a JSON object".to_string(),
            field: Some("attributes".to_string()),
            received: Some(other),
            docs_hint: None,
        }),
    }
}

fn contact_input(req: CreateContactRequest) -> Result<ContactInput, AppError> {
    Ok(ContactInput {
        phone_e164: normalize_phone(&req.phone)?,
        name: trimmed(req.name),
        email: trimmed(req.email).map(|e| e.to_lowercase()),
        tags: normalize_tags(req.tags),
        attributes: validate_attributes(req.attributes)?,
    })
}

/// `%` and `_` in user search input match literally.
fn like_pattern(q: &str) -> String {
    let escaped = q
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// List contacts, newest first
#[utoipa::path(
    get,
    path = "/v1/contacts",
    params(ListContactsParams),
    responses(
        (status = 200, description = "Page of contacts", body = PaginatedResponse<ContactResponse>),
        (status = 400, description = "Invalid cursor", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn list_contacts(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(params): AppQuery<ListContactsParams>,
) -> Result<Json<PaginatedResponse<ContactResponse>>, AppError> {
    user.require(Permission::ViewContacts, "list contacts")?;
    let limit = clamp_limit(params.limit);
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;
    let search = params
        .q
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .map(like_pattern);
    let tag = params
        .tag
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty());

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let rows = sqlx::query_as::<_, ContactResponse>(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts \
         WHERE ($1::timestamptz IS NULL OR (created_at, id) < ($1, $2)) \
           AND ($3::text IS NULL OR name ILIKE $3 OR phone_e164 LIKE $3) \
           AND ($4::text IS NULL OR $4 = ANY(tags)) \
         ORDER BY created_at DESC, id DESC \
         LIMIT $5"
    ))
    .bind(cursor.map(|c| c.timestamp))
    .bind(cursor.map(|c| c.id))
    .bind(search)
    .bind(tag)
    .bind(limit + 1)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(PaginatedResponse::from_rows(rows, limit, |c| {
        (c.created_at, c.id)
    })))
}

/// Create a contact
#[utoipa::path(
    post,
    path = "/v1/contacts",
    request_body = CreateContactRequest,
    responses(
        (status = 201, description = "Contact created", body = ContactResponse),
        (status = 400, description = "Invalid phone number", body = engage_core::error::ApiError),
        (status = 409, description = "Phone number already exists", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn create_contact(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateContactRequest>,
) -> Result<(StatusCode, Json<ContactResponse>), AppError> {
    user.require(Permission::ManageContacts, "create contact")?;
    let input = contact_input(req)?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let contact = sqlx::query_as::<_, ContactResponse>(&format!(
        "INSERT INTO contacts (id, organization_id, phone_e164, name, email, tags, attributes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {CONTACT_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(user.organization_id)
    .bind(&input.phone_e164)
    .bind(&input.name)
    .bind(&input.email)
    .bind(&input.tags)
    .bind(&input.attributes)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(contact)))
}

/// Import up to 500 contacts, upserting by phone number
///
/// Entries with an invalid phone number are reported and skipped; the rest
/// are written in one transaction. Existing contacts keep fields the entry
/// leaves empty, gain its tags and merge its attributes.
#[utoipa::path(
    post,
    path = "/v1/contacts/batch",
    request_body = BatchContactsRequest,
    responses(
        (status = 200, description = "Import summary", body = BatchContactsResponse),
        (status = 400, description = "Batch empty or too large", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn batch_upsert_contacts(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<BatchContactsRequest>,
) -> Result<Json<BatchContactsResponse>, AppError> {
    user.require(Permission::ManageContacts, "import contacts")?;
    if req.contacts.is_empty() || req.contacts.len() > MAX_BATCH_CONTACTS {
        return Err(AppError::Validation {
            message: format!("batch must contain 1 to {MAX_BATCH_CONTACTS} contacts"),
            field: Some("contacts".to_string()),
            received: Some(serde_json::json!(req.contacts.len())),
            docs_hint: Some("Split large imports into several requests.".to_string()),
        });
    }

    let mut rejected = Vec::new();
    let mut inputs = Vec::with_capacity(req.contacts.len());
    for (index, entry) in req.contacts.into_iter().enumerate() {
        match contact_input(entry) {
            Ok(input) => inputs.push(input),
            Err(AppError::Validation { message, field, .. }) => rejected.push(BatchContactError {
                index,
                field: field.unwrap_or_else(|| "contacts".to_string()),
                message,
            }),
            Err(other) => return Err(other),
        }
    }

    let mut created = 0;
    let mut updated = 0;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    for input in &inputs {
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO contacts (id, organization_id, phone_e164, name, email, tags, attributes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (organization_id, phone_e164) DO UPDATE SET \
                 name = COALESCE(EXCLUDED.name, contacts.name), \
                 email = COALESCE(EXCLUDED.email, contacts.email), \
                 tags = ARRAY(SELECT DISTINCT unnest(contacts.tags || EXCLUDED.tags) ORDER BY 1), \
                 attributes = contacts.attributes || EXCLUDED.attributes, \
                 updated_at = NOW() \
             RETURNING (xmax = 0)",
        )
        .bind(Uuid::now_v7())
        .bind(user.organization_id)
        .bind(&input.phone_e164)
        .bind(&input.name)
        .bind(&input.email)
        .bind(&input.tags)
        .bind(&input.attributes)
        .fetch_one(&mut *tx)
        .await?;
        if inserted {
            created += 1;
        } else {
            updated += 1;
        }
    }
    tx.commit().await?;

    tracing::info!(
        organization_id = %user.organization_id,
        created,
        updated,
        rejected = rejected.len(),
        "contact batch imported"
    );
    Ok(Json(BatchContactsResponse {
        created,
        updated,
        rejected,
    }))
}

/// Get a contact
#[utoipa::path(
    get,
    path = "/v1/contacts/{id}",
    params(("id" = Uuid, Path, description = "Contact ID")),
    responses(
        (status = 200, description = "Contact", body = ContactResponse),
        (status = 404, description = "Contact not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn get_contact(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContactResponse>, AppError> {
    user.require(Permission::ViewContacts, "get contact")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let contact = sqlx::query_as::<_, ContactResponse>(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Contact {id}")))?;
    tx.commit().await?;
    Ok(Json(contact))
}

/// Update a contact
#[utoipa::path(
    patch,
    path = "/v1/contacts/{id}",
    params(("id" = Uuid, Path, description = "Contact ID")),
    request_body = UpdateContactRequest,
    responses(
        (status = 200, description = "Contact updated", body = ContactResponse),
        (status = 404, description = "Contact not found", body = engage_core::error::ApiError),
        (status = 409, description = "Phone number already exists", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn update_contact(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(req): AppJson<UpdateContactRequest>,
) -> Result<Json<ContactResponse>, AppError> {
    user.require(Permission::ManageContacts, "update contact")?;

    let phone = req.phone.as_deref().map(normalize_phone).transpose()?;
    let tags = req.tags.map(normalize_tags);
    let attributes = req
        .attributes
        .map(|a| validate_attributes(Some(a)))
        .transpose()?;

    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let contact = sqlx::query_as::<_, ContactResponse>(&format!(
        "UPDATE contacts SET \
             phone_e164 = COALESCE($2, phone_e164), \
             name = CASE WHEN $3 THEN $4 ELSE name END, \
             email = CASE WHEN $5 THEN $6 ELSE email END, \
             tags = COALESCE($7, tags), \
             attributes = CASE WHEN $8::jsonb IS NULL THEN attributes ELSE attributes || $8 END, \
             opted_out = COALESCE($9, opted_out), \
             opted_out_at = CASE \
                 WHEN $9 IS TRUE AND NOT opted_out THEN NOW() \
                 WHEN $9 IS FALSE THEN NULL \
                 ELSE opted_out_at END, \
             updated_at = NOW() \
         WHERE id = $1 \
         RETURNING {CONTACT_COLUMNS}"
    ))
    .bind(id)
    .bind(phone)
    .bind(req.name.is_some())
    .bind(trimmed(req.name.flatten()))
    .bind(req.email.is_some())
    .bind(trimmed(req.email.flatten()).map(|e| e.to_lowercase()))
    .bind(tags)
    .bind(attributes)
    .bind(req.opted_out)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found(format!("Contact {id}")))?;
    tx.commit().await?;
    Ok(Json(contact))
}

/// Delete a contact with its conversations and campaign recipients
#[utoipa::path(
    delete,
    path = "/v1/contacts/{id}",
    params(("id" = Uuid, Path, description = "Contact ID")),
    responses(
        (status = 204, description = "Contact deleted"),
        (status = 404, description = "Contact not found", body = engage_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "contacts"
)]
pub async fn delete_contact(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    user.require(Permission::ManageContacts, "delete contact")?;
    let mut tx = begin_tenant(&state.db, user.organization_id).await?;
    let deleted = sqlx::query("DELETE FROM contacts WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    if deleted == 0 {
        return Err(AppError::not_found(format!("Contact {id}")));
    }
    tracing::info!(contact_id = %id, actor = %user.profile_id, "contact deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" ana "), "%ana%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn contact_input_normalizes_fields() {
        let input = contact_input(CreateContactRequest {
            phone: "0049 151 2345 6789".to_string(),
            name: Some("  ".to_string()),
            email: Some(" Ana@Example.com ".to_string()),
            tags: vec!["VIP".to_string(), "vip".to_string(), " ".to_string()],
            attributes: None,
        })
        .unwrap();
        assert_eq!(input.phone_e164, "+4915123456789");
        assert_eq!(input.name, None);
        assert_eq!(input.email.as_deref(), Some("ana@example.com"));
        assert_eq!(input.tags, vec!["vip"]);
        assert_eq!(input.attributes, serde_json::json!({}));
    }

    #[test]
    fn attributes_must_be_an_object() {
        assert!(validate_attributes(Some(serde_json::json!(["a"]))).is_err());
        assert!(validate_attributes(Some(serde_json::json!({"plan": "gold"}))).is_ok());
    }

    #[test]
    fn batch_request_rejects_unknown_fields() {
        let parsed: Result<BatchContactsRequest, _> =
            serde_json::from_str(r#"{"contacts": [{"phone": "+15551234567", "colour": "red"}]}"#);
        assert!(parsed.is_err());
    }
}
