use serde::Deserialize;
use serde_json::json;

use crate::util::{
    EXIT_CLIENT_ERROR, EXIT_CONNECTION_ERROR, EXIT_OK, StoredCredentials, api_request,
    config_path, exit_code_for_status, exit_error, load_credentials, print_json, require_token,
    save_credentials, send_request,
};

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn login(api_url: &str, email: &str, password: Option<String>) -> i32 {
    let password = match password {
        Some(p) => p,
        None => exit_error(
            "A password is required",
            Some("Pass --password or set ENGAGE_PASSWORD."),
        ),
    };

    let body = json!({ "email": email, "password": password });
    let (status, body) = match send_request(
        api_url,
        reqwest::Method::POST,
        "/v1/auth/login",
        None,
        Some(&body),
        &[],
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", json!({ "error": "connection_error", "message": e }));
            return EXIT_CONNECTION_ERROR;
        }
    };

    let code = exit_code_for_status(status);
    if code != EXIT_OK {
        eprintln!("{body:#}");
        return code;
    }

    let login: LoginResponse = match serde_json::from_value(body) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", json!({ "error": "cli_error", "message": format!("Unexpected login response: {e}") }));
            return EXIT_CLIENT_ERROR;
        }
    };

    let creds = StoredCredentials {
        api_url: api_url.to_string(),
        email: email.to_string(),
        access_token: login.access_token,
        expires_at: login.expires_at,
    };
    if let Err(e) = save_credentials(&creds) {
        exit_error(&format!("Failed to store credentials: {e}"), None);
    }

    print_json(&json!({
        "status": "authenticated",
        "email": creds.email,
        "expires_at": creds.expires_at,
        "config_path": config_path().to_string_lossy()
    }));
    EXIT_OK
}

/// Revoke the stored login token server-side (best effort) and forget it.
pub async fn logout(api_url: &str) -> i32 {
    let path = config_path();
    let revoked = match load_credentials() {
        Some(creds) => send_request(
            &creds.api_url,
            reqwest::Method::POST,
            "/v1/auth/logout",
            Some(&creds.access_token),
            None,
            &[],
        )
        .await
        .map(|(status, _)| (200..300).contains(&status))
        .unwrap_or(false),
        None => false,
    };

    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            exit_error(&format!("Failed to remove credentials: {e}"), None);
        }
    }

    print_json(&json!({
        "status": "logged_out",
        "revoked": revoked,
        "api_url": api_url,
        "config_path": path.to_string_lossy()
    }));
    EXIT_OK
}

pub async fn me(api_url: &str) -> i32 {
    let token = require_token(api_url);
    api_request(api_url, reqwest::Method::GET, "/v1/auth/me", Some(&token), None, &[]).await
}
