use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use engage_core::roles::Role;

use crate::util::{EXIT_CLIENT_ERROR, EXIT_OK, EXIT_SERVER_ERROR, exit_error, print_json};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Create an organization (requires DATABASE_URL)
    CreateOrg {
        #[arg(long)]
        name: String,
        /// WhatsApp phone number id that routes inbound webhooks to this org
        #[arg(long)]
        phone_number_id: Option<String>,
    },
    /// Create a profile in an organization (requires DATABASE_URL)
    CreateProfile {
        #[arg(long)]
        org_id: Uuid,
        #[arg(long)]
        email: String,
        #[arg(long, env = "ENGAGE_PASSWORD", hide_env_values = true)]
        password: String,
        /// admin, general_manager, team_leader or agent
        #[arg(long, default_value = "admin")]
        role: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// Create an API key for a profile (requires DATABASE_URL)
    CreateKey {
        #[arg(long)]
        profile_id: Uuid,
        /// Human-readable label (e.g. "crm-sync")
        #[arg(long)]
        label: String,
        /// Expiration in days (default: never)
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
}

pub async fn run(command: AdminCommands) -> i32 {
    let pool = connect().await;
    let result = match command {
        AdminCommands::CreateOrg {
            name,
            phone_number_id,
        } => create_org(&pool, &name, phone_number_id.as_deref()).await,
        AdminCommands::CreateProfile {
            org_id,
            email,
            password,
            role,
            full_name,
        } => create_profile(&pool, org_id, &email, &password, &role, full_name.as_deref()).await,
        AdminCommands::CreateKey {
            profile_id,
            label,
            expires_in_days,
        } => create_key(&pool, profile_id, &label, expires_in_days).await,
    };

    match result {
        Ok(output) => {
            print_json(&output);
            EXIT_OK
        }
        Err(AdminError::Invalid(message)) => {
            eprintln!("{}", json!({ "error": "validation_failed", "message": message }));
            EXIT_CLIENT_ERROR
        }
        Err(AdminError::Database(e)) => {
            let code = match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => EXIT_CLIENT_ERROR,
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => EXIT_CLIENT_ERROR,
                _ => EXIT_SERVER_ERROR,
            };
            eprintln!("{}", json!({ "error": "database_error", "message": e.to_string() }));
            code
        }
    }
}

enum AdminError {
    Invalid(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for AdminError {
    fn from(e: sqlx::Error) -> Self {
        AdminError::Database(e)
    }
}

async fn connect() -> sqlx::PgPool {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => exit_error(
            "DATABASE_URL must be set for admin commands",
            Some("Admin create commands connect directly to the database for bootstrapping"),
        ),
    };

    match sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", json!({ "error": "connection_error", "message": format!("Failed to connect to database: {e}") }));
            std::process::exit(crate::util::EXIT_CONNECTION_ERROR);
        }
    }
}

async fn create_org(
    pool: &sqlx::PgPool,
    name: &str,
    phone_number_id: Option<&str>,
) -> Result<serde_json::Value, AdminError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AdminError::Invalid("name must not be empty".to_string()));
    }
    let org_id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO organizations (id, name, whatsapp_phone_number_id) VALUES ($1, $2, $3)",
    )
    .bind(org_id)
    .bind(name)
    .bind(phone_number_id)
    .execute(pool)
    .await?;

    Ok(json!({
        "organization_id": org_id,
        "name": name,
        "whatsapp_phone_number_id": phone_number_id
    }))
}

fn validate_profile_input(email: &str, password: &str, role: &str) -> Result<Role, AdminError> {
    if !email.contains('@') || email.trim() != email {
        return Err(AdminError::Invalid(format!("'{email}' is not a valid email")));
    }
    if password.chars().count() < 10 {
        return Err(AdminError::Invalid("password must be at least 10 characters".to_string()));
    }
    Role::parse(role).map_err(|e| AdminError::Invalid(e.to_string()))
}

async fn create_profile(
    pool: &sqlx::PgPool,
    org_id: Uuid,
    email: &str,
    password: &str,
    role: &str,
    full_name: Option<&str>,
) -> Result<serde_json::Value, AdminError> {
    let role = validate_profile_input(email, password, role)?;
    let password_hash = engage_core::auth::hash_password(password).map_err(AdminError::Invalid)?;
    let profile_id = Uuid::now_v7();

    sqlx::query(
        "INSERT INTO profiles (id, organization_id, email, password_hash, full_name, role) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(profile_id)
    .bind(org_id)
    .bind(email.to_lowercase())
    .bind(&password_hash)
    .bind(full_name)
    .bind(role.as_str())
    .execute(pool)
    .await?;

    Ok(json!({
        "profile_id": profile_id,
        "organization_id": org_id,
        "email": email.to_lowercase(),
        "role": role.as_str(),
        "full_name": full_name
    }))
}

async fn create_key(
    pool: &sqlx::PgPool,
    profile_id: Uuid,
    label: &str,
    expires_in_days: Option<i64>,
) -> Result<serde_json::Value, AdminError> {
    if matches!(expires_in_days, Some(d) if d <= 0) {
        return Err(AdminError::Invalid("expires_in_days must be positive".to_string()));
    }
    let (full_key, key_hash) = engage_core::auth::generate_api_key();
    let prefix = engage_core::auth::key_prefix(&full_key);
    let key_id = Uuid::now_v7();
    let expires_at = expires_in_days.map(|d| chrono::Utc::now() + chrono::Duration::days(d));

    sqlx::query(
        "INSERT INTO api_keys (id, profile_id, key_hash, key_prefix, label, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(key_id)
    .bind(profile_id)
    .bind(&key_hash)
    .bind(&prefix)
    .bind(label)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(json!({
        "key_id": key_id,
        "api_key": full_key,
        "key_prefix": prefix,
        "label": label,
        "expires_at": expires_at,
        "warning": "Store this key securely. It will NOT be shown again."
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_input_is_validated_before_touching_the_database() {
        assert!(matches!(
            validate_profile_input("ops@example.com", "correct-horse-battery", "team_leader"),
            Ok(Role::TeamLeader)
        ));
        assert!(validate_profile_input("not-an-email", "correct-horse-battery", "agent").is_err());
        assert!(validate_profile_input("ops@example.com", "short", "agent").is_err());
        assert!(validate_profile_input("ops@example.com", "correct-horse-battery", "owner").is_err());
    }
}
