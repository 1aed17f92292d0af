use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{EXIT_OK, api_request, exit_error, print_json, read_input, require_token};

#[derive(Subcommand)]
pub enum WebhookCommands {
    /// Print the X-Hub-Signature-256 header for a captured payload
    Sign {
        /// Raw payload file (use '-' for stdin); signed byte for byte
        #[arg(long)]
        file: String,
        #[arg(long, env = "WHATSAPP_APP_SECRET", hide_env_values = true)]
        app_secret: String,
    },
    /// Reprocess a stored webhook delivery (admin)
    Replay {
        event_id: Uuid,
    },
    /// List stored deliveries that have not been processed (admin)
    Pending {
        #[arg(long)]
        limit: Option<u32>,
    },
}

pub async fn run(api_url: &str, command: WebhookCommands) -> i32 {
    match command {
        WebhookCommands::Sign { file, app_secret } => {
            if app_secret.is_empty() {
                exit_error("The app secret is empty", Some("Set WHATSAPP_APP_SECRET or pass --app-secret."));
            }
            let body = read_input(&file).unwrap_or_else(|e| exit_error(&e, None));
            print_json(&json!({
                "header": engage_core::webhook::SIGNATURE_HEADER,
                "value": engage_core::webhook::sign(&app_secret, &body),
                "payload_digest": engage_core::webhook::payload_digest(&body),
                "bytes": body.len()
            }));
            EXIT_OK
        }
        WebhookCommands::Replay { event_id } => {
            let token = require_token(api_url);
            let path = format!("/v1/admin/webhooks/{event_id}/replay");
            api_request(api_url, reqwest::Method::POST, &path, Some(&token), None, &[]).await
        }
        WebhookCommands::Pending { limit } => {
            let token = require_token(api_url);
            let mut query = vec![("unprocessed".to_string(), "true".to_string())];
            if let Some(l) = limit {
                query.push(("limit".to_string(), l.to_string()));
            }
            api_request(api_url, reqwest::Method::GET, "/v1/admin/webhooks", Some(&token), None, &query)
                .await
        }
    }
}
