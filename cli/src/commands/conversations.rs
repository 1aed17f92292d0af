use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, exit_error, query_pairs, require_token};

#[derive(Subcommand)]
pub enum ConversationCommands {
    /// List conversations visible to you, most recent activity first
    List {
        /// Filter by status (open, expired, closed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        assigned_to: Option<Uuid>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show the message history of a conversation
    Messages {
        id: Uuid,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Reply with free text (needs an open window) or an approved template
    Reply {
        id: Uuid,
        /// Free-form text body
        #[arg(long, conflicts_with = "template_id")]
        text: Option<String>,
        /// Approved template to send instead of text
        #[arg(long)]
        template_id: Option<Uuid>,
        /// Template body parameter (repeatable)
        #[arg(long = "param", requires = "template_id")]
        params: Vec<String>,
    },
    /// Assign to a profile
    Assign {
        id: Uuid,
        #[arg(long)]
        profile_id: Uuid,
    },
    /// Close the conversation
    Close {
        id: Uuid,
    },
}

pub async fn run(api_url: &str, command: ConversationCommands) -> i32 {
    let token = require_token(api_url);
    let token = Some(token.as_str());
    match command {
        ConversationCommands::List {
            status,
            assigned_to,
            limit,
            cursor,
        } => {
            let query = query_pairs(&[
                ("status", status),
                ("assigned_to", assigned_to.map(|id| id.to_string())),
                ("limit", limit.map(|l| l.to_string())),
                ("cursor", cursor),
            ]);
            api_request(api_url, reqwest::Method::GET, "/v1/conversations", token, None, &query)
                .await
        }
        ConversationCommands::Messages { id, limit, cursor } => {
            let path = format!("/v1/conversations/{id}/messages");
            let query = query_pairs(&[("limit", limit.map(|l| l.to_string())), ("cursor", cursor)]);
            api_request(api_url, reqwest::Method::GET, &path, token, None, &query).await
        }
        ConversationCommands::Reply {
            id,
            text,
            template_id,
            params,
        } => {
            let body = reply_body(text, template_id, params).unwrap_or_else(|e| {
                exit_error(&e, Some("Use --text <body> or --template-id <uuid> [--param ...]"))
            });
            let path = format!("/v1/conversations/{id}/messages");
            api_request(api_url, reqwest::Method::POST, &path, token, Some(body), &[]).await
        }
        ConversationCommands::Assign { id, profile_id } => {
            let path = format!("/v1/conversations/{id}/assign");
            let body = json!({ "profile_id": profile_id });
            api_request(api_url, reqwest::Method::POST, &path, token, Some(body), &[]).await
        }
        ConversationCommands::Close { id } => {
            let path = format!("/v1/conversations/{id}/close");
            api_request(api_url, reqwest::Method::POST, &path, token, None, &[]).await
        }
    }
}

fn reply_body(
    text: Option<String>,
    template_id: Option<Uuid>,
    params: Vec<String>,
) -> Result<serde_json::Value, String> {
    match (text, template_id) {
        (Some(body), None) if !body.trim().is_empty() => Ok(json!({ "type": "text", "body": body })),
        (None, Some(template_id)) => Ok(json!({
            "type": "template",
            "template_id": template_id,
            "params": params
        })),
        _ => Err("A reply needs non-empty --text or --template-id".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::reply_body;
    use uuid::Uuid;

    #[test]
    fn text_reply_body() {
        let body = reply_body(Some("hi there".to_string()), None, vec![]).unwrap();
        assert_eq!(body["type"], "text");
        assert_eq!(body["body"], "hi there");
    }

    #[test]
    fn template_reply_body_carries_params() {
        let id = Uuid::now_v7();
        let body = reply_body(None, Some(id), vec!["Ana".to_string()]).unwrap();
        assert_eq!(body["type"], "template");
        assert_eq!(body["template_id"], id.to_string());
        assert_eq!(body["params"][0], "Ana");
    }

    #[test]
    fn empty_reply_is_rejected() {
        assert!(reply_body(None, None, vec![]).is_err());
        assert!(reply_body(Some("  ".to_string()), None, vec![]).is_err());
    }
}
