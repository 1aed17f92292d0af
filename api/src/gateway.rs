//! Messaging gateway integration surface.
//!
//! Everything that leaves the process towards WhatsApp goes through
//! [`MessagingGateway`]. The production implementation talks to the Cloud API;
//! tests substitute an in-memory fake.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};

use engage_core::campaigns::SendFailure;

use crate::config::WhatsAppConfig;

/// Provider error codes that signal throttling rather than a bad request.
const RATE_LIMIT_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

/// "Re-engagement message": more than 24h since the customer last replied.
pub const WINDOW_EXPIRED_CODE: i64 = 131047;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTemplate {
    pub phone_number_id: String,
    pub to: String,
    pub template_name: String,
    pub language: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    pub phone_number_id: String,
    pub to: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected the message ({code}): {message}")]
    Rejected { code: i64, message: String },
}

impl GatewayError {
    pub fn as_send_failure(&self) -> SendFailure {
        match self {
            GatewayError::RateLimited { retry_after } => SendFailure::RateLimited {
                retry_after: *retry_after,
            },
            GatewayError::Unavailable(_) => SendFailure::Transient,
            GatewayError::Rejected { .. } => SendFailure::Permanent,
        }
    }

    pub fn code(&self) -> String {
        match self {
            GatewayError::RateLimited { .. } => "rate_limited".to_string(),
            GatewayError::Unavailable(_) => "unavailable".to_string(),
            GatewayError::Rejected { code, .. } => code.to_string(),
        }
    }

    pub fn is_window_expired(&self) -> bool {
        matches!(self, GatewayError::Rejected { code, .. } if *code == WINDOW_EXPIRED_CODE)
    }
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_template(&self, message: &OutboundTemplate) -> Result<SendReceipt, GatewayError>;
    async fn send_text(&self, message: &OutboundText) -> Result<SendReceipt, GatewayError>;
}

pub struct WhatsAppCloudClient {
    http: reqwest::Client,
    api_base: String,
    api_version: String,
    access_token: String,
}

impl WhatsAppCloudClient {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!(
            "{}/{}/{}/messages",
            self.api_base, self.api_version, phone_number_id
        )
    }

    async fn post_message(&self, phone_number_id: &str, body: Value) -> Result<SendReceipt, GatewayError> {
        let response = self
            .http
            .post(self.messages_url(phone_number_id))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(Duration::seconds);
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        if status.is_success() {
            let parsed: SendResponse = serde_json::from_str(&text)
                .map_err(|e| GatewayError::Unavailable(format!("unreadable send response: {e}")))?;
            return parsed
                .messages
                .into_iter()
                .next()
                .map(|m| SendReceipt {
                    provider_message_id: m.id,
                })
                .ok_or_else(|| GatewayError::Unavailable("send response without message id".to_string()));
        }

        Err(classify_failure(status.as_u16(), &text, retry_after))
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ProviderErrorBody,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_data: Option<ErrorData>,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    details: Option<String>,
}

pub fn classify_failure(status: u16, body: &str, retry_after: Option<Duration>) -> GatewayError {
    let provider = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let code = provider.as_ref().and_then(|e| e.code);
    let message = provider
        .as_ref()
        .and_then(|e| {
            e.error_data
                .as_ref()
                .and_then(|d| d.details.clone())
                .or_else(|| e.message.clone())
        })
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == 429 || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
        return GatewayError::RateLimited { retry_after };
    }
    if status >= 500 {
        return GatewayError::Unavailable(message);
    }
    GatewayError::Rejected {
        code: code.unwrap_or(i64::from(status)),
        message,
    }
}

pub fn template_payload(message: &OutboundTemplate) -> Value {
    let mut template = json!({
        "name": message.template_name,
        "language": { "code": message.language },
    });
    if !message.params.is_empty() {
        let parameters: Vec<Value> = message
            .params
            .iter()
            .map(|p| json!({ "type": "text", "text": p }))
            .collect();
        template["components"] = json!([{ "type": "body", "parameters": parameters }]);
    }
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": message.to,
        "type": "template",
        "template": template,
    })
}

pub fn text_payload(message: &OutboundText) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": message.to,
        "type": "text",
        "text": { "body": message.body, "preview_url": false },
    })
}

#[async_trait]
impl MessagingGateway for WhatsAppCloudClient {
    async fn send_template(&self, message: &OutboundTemplate) -> Result<SendReceipt, GatewayError> {
        tracing::debug!(
            to = %message.to,
            template = %message.template_name,
            "sending template message"
        );
        self.post_message(&message.phone_number_id, template_payload(message))
            .await
    }

    async fn send_text(&self, message: &OutboundText) -> Result<SendReceipt, GatewayError> {
        tracing::debug!(to = %message.to, body_len = message.body.len(), "sending text message");
        self.post_message(&message.phone_number_id, text_payload(message))
            .await
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Records every send; scripted failures are keyed by recipient.
    #[derive(Default)]
    pub struct FakeGateway {
        pub sent: Mutex<Vec<String>>,
        pub failures: Mutex<HashMap<String, GatewayError>>,
    }

    impl FakeGateway {
        pub fn failing(to: &str, error: GatewayError) -> Self {
            let gateway = FakeGateway::default();
            gateway
                .failures
                .lock()
                .unwrap()
                .insert(to.to_string(), error);
            gateway
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        fn deliver(&self, to: &str) -> Result<SendReceipt, GatewayError> {
            if let Some(error) = self.failures.lock().unwrap().get(to) {
                return Err(error.clone());
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(to.to_string());
            Ok(SendReceipt {
                provider_message_id: format!("wamid.fake.{}", sent.len()),
            })
        }
    }

    #[async_trait]
    impl MessagingGateway for FakeGateway {
        async fn send_template(&self, message: &OutboundTemplate) -> Result<SendReceipt, GatewayError> {
            self.deliver(&message.to)
        }

        async fn send_text(&self, message: &OutboundText) -> Result<SendReceipt, GatewayError> {
            self.deliver(&message.to)
        }
    }
}
