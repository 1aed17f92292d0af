use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Exit codes shared by every command.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CLIENT_ERROR: i32 = 1;
pub const EXIT_SERVER_ERROR: i32 = 2;
pub const EXIT_CONNECTION_ERROR: i32 = 3;
pub const EXIT_USAGE_ERROR: i32 = 4;

/// Login token stored by `engage login`
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub api_url: String,
    pub email: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

fn eprint_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => eprintln!("{s}"),
        Err(_) => eprintln!("{value}"),
    }
}

/// Print a structured usage error and exit with code 4.
pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprint_json(&err);
    std::process::exit(EXIT_USAGE_ERROR);
}

pub fn config_path() -> std::path::PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("engage");
    config_dir.join("credentials.json")
}

pub fn load_credentials() -> Option<StoredCredentials> {
    let data = std::fs::read_to_string(config_path()).ok()?;
    serde_json::from_str(&data).ok()
}

pub fn save_credentials(creds: &StoredCredentials) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string_pretty(creds)?;

    // Write with restricted permissions (0o600)
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(data.as_bytes())?;

    Ok(())
}

/// Resolve a Bearer token for API requests (priority order):
/// 1. ENGAGE_API_KEY env var
/// 2. stored login token, when it belongs to this API and has not expired
pub fn resolve_token(api_url: &str) -> Result<String, String> {
    if let Ok(key) = std::env::var("ENGAGE_API_KEY") {
        if !key.trim().is_empty() {
            return Ok(key);
        }
    }

    match load_credentials() {
        Some(creds) if creds.api_url != api_url => Err(format!(
            "Stored login is for {}, not {api_url}. Run `engage login` again.",
            creds.api_url
        )),
        Some(creds) if Utc::now() >= creds.expires_at => {
            Err("Login token expired. Run `engage login` again.".to_string())
        }
        Some(creds) => Ok(creds.access_token),
        None => Err("No credentials found. Run `engage login` or set ENGAGE_API_KEY.".to_string()),
    }
}

/// Token for an authenticated command; exits with a usage error when none is
/// configured.
pub fn require_token(api_url: &str) -> String {
    resolve_token(api_url).unwrap_or_else(|e| {
        exit_error(
            &e,
            Some("Run `engage login --email <email>` or export ENGAGE_API_KEY."),
        )
    })
}

pub fn exit_code_for_status(status: u16) -> i32 {
    match status {
        200..=299 => EXIT_OK,
        400..=499 => EXIT_CLIENT_ERROR,
        _ => EXIT_SERVER_ERROR,
    }
}

/// Send a request and return the status with the JSON body. Connection
/// failures are reported as `Err`.
pub async fn send_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    token: Option<&str>,
    body: Option<&serde_json::Value>,
    query: &[(String, String)],
) -> Result<(u16, serde_json::Value), String> {
    let mut url = reqwest::Url::parse(&format!("{api_url}{path}"))
        .map_err(|e| format!("Invalid URL: {api_url}{path}: {e}"))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }

    let mut req = client().request(method, url);
    if let Some(t) = token {
        req = req.header("Authorization", format!("Bearer {t}"));
    }
    if let Some(b) = body {
        req = req.json(b);
    }

    let resp = req.send().await.map_err(|e| e.to_string())?;
    let status = resp.status().as_u16();
    let text = resp.text().await.map_err(|e| e.to_string())?;
    let body = if text.is_empty() {
        json!({ "status": status })
    } else {
        serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }))
    };
    Ok((status, body))
}

/// Execute an API request, print the response, return the exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
) -> i32 {
    match send_request(api_url, method, path, token, body.as_ref(), query).await {
        Ok((status, body)) => {
            let code = exit_code_for_status(status);
            if code == EXIT_OK {
                print_json(&body);
            } else {
                eprint_json(&body);
            }
            code
        }
        Err(e) => {
            eprint_json(&json!({
                "error": "connection_error",
                "message": e,
                "docs_hint": "Is the API server running? Check ENGAGE_API_URL."
            }));
            EXIT_CONNECTION_ERROR
        }
    }
}

/// Collect `key=value` query pairs, skipping absent values.
pub fn query_pairs(pairs: &[(&str, Option<String>)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// Read a file, or stdin when path is "-".
pub fn read_input(path: &str) -> Result<Vec<u8>, String> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {e}"))?;
        Ok(buf)
    } else {
        std::fs::read(path).map_err(|e| format!("Failed to read file '{path}': {e}"))
    }
}

pub fn read_json_from_file(path: &str) -> Result<serde_json::Value, String> {
    let raw = read_input(path)?;
    serde_json::from_slice(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}

// Unix-specific imports for file permissions
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

// No-op on non-unix
#[cfg(not(unix))]
trait OpenOptionsExt {
    fn mode(&mut self, _mode: u32) -> &mut Self;
}

#[cfg(not(unix))]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn mode(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_exit_codes() {
        assert_eq!(exit_code_for_status(200), EXIT_OK);
        assert_eq!(exit_code_for_status(204), EXIT_OK);
        assert_eq!(exit_code_for_status(404), EXIT_CLIENT_ERROR);
        assert_eq!(exit_code_for_status(429), EXIT_CLIENT_ERROR);
        assert_eq!(exit_code_for_status(500), EXIT_SERVER_ERROR);
        assert_eq!(exit_code_for_status(502), EXIT_SERVER_ERROR);
    }

    #[test]
    fn credentials_live_under_engage_config_dir() {
        let path = config_path();
        assert!(path.ends_with("engage/credentials.json"));
    }

    #[test]
    fn query_pairs_skip_missing_values() {
        let pairs = query_pairs(&[
            ("status", Some("sent".to_string())),
            ("cursor", None),
            ("limit", Some("10".to_string())),
        ]);
        assert_eq!(
            pairs,
            vec![
                ("status".to_string(), "sent".to_string()),
                ("limit".to_string(), "10".to_string())
            ]
        );
    }

    #[test]
    fn json_file_is_read_and_parsed() {
        let path = std::env::temp_dir().join(format!("engage-cli-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, r#"[{"phone": "+15551234567"}]"#).unwrap();
        let value = read_json_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(value[0]["phone"], "+15551234567");
        std::fs::remove_file(&path).unwrap();

        let err = read_json_from_file("/nonexistent/engage.json").unwrap_err();
        assert!(err.contains("Failed to read file"));
    }
}
