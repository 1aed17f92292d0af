use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, exit_error, query_pairs, require_token};

#[derive(Subcommand)]
pub enum CampaignCommands {
    /// List campaigns, newest first
    List {
        /// Filter by status (draft, scheduled, sending, sent, completed, cancelled, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// Pagination cursor from a previous response
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show one campaign
    Get {
        id: Uuid,
    },
    /// Create a draft campaign
    Create {
        #[arg(long)]
        name: String,
        /// Approved template to send
        #[arg(long)]
        template_id: Uuid,
        /// Template body parameter, in placeholder order (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
        /// Target contacts carrying any of these tags (repeatable; none = all contacts)
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        batch_size: Option<i32>,
        #[arg(long)]
        batch_delay_ms: Option<i32>,
    },
    /// Schedule a draft campaign
    Schedule {
        id: Uuid,
        /// Absolute start time (RFC3339)
        #[arg(long, conflicts_with_all = ["local_time", "timezone"])]
        at: Option<String>,
        /// Local wall-clock start time (e.g. 2026-11-02T09:00:00)
        #[arg(long, requires = "timezone")]
        local_time: Option<String>,
        /// IANA timezone for --local-time (e.g. Europe/Berlin)
        #[arg(long, requires = "local_time")]
        timezone: Option<String>,
    },
    /// Start sending now
    Start {
        id: Uuid,
    },
    /// Cancel a scheduled or sending campaign
    Cancel {
        id: Uuid,
    },
    /// Delivery statistics
    Analytics {
        id: Uuid,
    },
    /// List recipients with their delivery status
    Recipients {
        id: Uuid,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
}

pub async fn run(api_url: &str, command: CampaignCommands) -> i32 {
    let token = require_token(api_url);
    let token = Some(token.as_str());
    match command {
        CampaignCommands::List {
            status,
            limit,
            cursor,
        } => {
            let query = query_pairs(&[
                ("status", status),
                ("limit", limit.map(|l| l.to_string())),
                ("cursor", cursor),
            ]);
            api_request(api_url, reqwest::Method::GET, "/v1/campaigns", token, None, &query).await
        }
        CampaignCommands::Get { id } => {
            let path = format!("/v1/campaigns/{id}");
            api_request(api_url, reqwest::Method::GET, &path, token, None, &[]).await
        }
        CampaignCommands::Create {
            name,
            template_id,
            params,
            tags,
            batch_size,
            batch_delay_ms,
        } => {
            let body = json!({
                "name": name,
                "template_id": template_id,
                "template_params": params,
                "tag_filter": tags,
                "batch_size": batch_size,
                "batch_delay_ms": batch_delay_ms,
            });
            api_request(api_url, reqwest::Method::POST, "/v1/campaigns", token, Some(body), &[])
                .await
        }
        CampaignCommands::Schedule {
            id,
            at,
            local_time,
            timezone,
        } => {
            let body = schedule_body(at, local_time, timezone).unwrap_or_else(|e| {
                exit_error(
                    &e,
                    Some("Use --at <RFC3339> or --local-time <YYYY-MM-DDTHH:MM:SS> --timezone <IANA name>"),
                )
            });
            let path = format!("/v1/campaigns/{id}/schedule");
            api_request(api_url, reqwest::Method::POST, &path, token, Some(body), &[]).await
        }
        CampaignCommands::Start { id } => {
            let path = format!("/v1/campaigns/{id}/start");
            api_request(api_url, reqwest::Method::POST, &path, token, None, &[]).await
        }
        CampaignCommands::Cancel { id } => {
            let path = format!("/v1/campaigns/{id}/cancel");
            api_request(api_url, reqwest::Method::POST, &path, token, None, &[]).await
        }
        CampaignCommands::Analytics { id } => {
            let path = format!("/v1/campaigns/{id}/analytics");
            api_request(api_url, reqwest::Method::GET, &path, token, None, &[]).await
        }
        CampaignCommands::Recipients {
            id,
            status,
            limit,
            cursor,
        } => {
            let path = format!("/v1/campaigns/{id}/recipients");
            let query = query_pairs(&[
                ("status", status),
                ("limit", limit.map(|l| l.to_string())),
                ("cursor", cursor),
            ]);
            api_request(api_url, reqwest::Method::GET, &path, token, None, &query).await
        }
    }
}

fn schedule_body(
    at: Option<String>,
    local_time: Option<String>,
    timezone: Option<String>,
) -> Result<serde_json::Value, String> {
    match (at, local_time, timezone) {
        (Some(at), None, None) => {
            let at = chrono::DateTime::parse_from_rfc3339(&at)
                .map_err(|e| format!("Invalid --at '{at}': {e}"))?;
            Ok(json!({ "scheduled_at": at.with_timezone(&chrono::Utc) }))
        }
        (None, Some(local_time), Some(timezone)) => {
            Ok(json!({ "local_time": local_time, "timezone": timezone }))
        }
        _ => Err("Give either --at or --local-time with --timezone".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::schedule_body;

    #[test]
    fn absolute_schedule_is_normalized_to_utc() {
        let body = schedule_body(Some("2026-11-02T09:00:00+01:00".to_string()), None, None).unwrap();
        assert_eq!(body["scheduled_at"], "2026-11-02T08:00:00Z");
    }

    #[test]
    fn local_schedule_passes_timezone_through() {
        let body = schedule_body(
            None,
            Some("2026-11-02T09:00:00".to_string()),
            Some("Europe/Berlin".to_string()),
        )
        .unwrap();
        assert_eq!(body["local_time"], "2026-11-02T09:00:00");
        assert_eq!(body["timezone"], "Europe/Berlin");
    }

    #[test]
    fn schedule_needs_a_time() {
        assert!(schedule_body(None, None, None).is_err());
        assert!(schedule_body(Some("tomorrow".to_string()), None, None).is_err());
    }
}
