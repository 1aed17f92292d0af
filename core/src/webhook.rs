//! Gateway webhook payloads.
//!
//! The WhatsApp Cloud API posts a nested envelope
//! (`entry[].changes[].value.{statuses,messages}`) for every delivery receipt
//! and inbound customer message, signed with the app secret in
//! `X-Hub-Signature-256`. This module models that envelope, flattens it into
//! domain events, and verifies the signature.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::delivery::{RecipientStatus, map_provider_status};
use crate::templates::TemplateStatus;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Change {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
    #[serde(default)]
    pub statuses: Vec<WebhookStatus>,
    // message_template_status_update fields
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub message_template_id: Option<serde_json::Value>,
    #[serde(default)]
    pub message_template_name: Option<String>,
    #[serde(default)]
    pub message_template_language: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub display_phone_number: String,
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookContact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub image: Option<MediaBody>,
    #[serde(default)]
    pub video: Option<MediaBody>,
    #[serde(default)]
    pub document: Option<MediaBody>,
    #[serde(default)]
    pub button: Option<ButtonBody>,
    #[serde(default)]
    pub interactive: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MediaBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ButtonBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<WebhookError>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WebhookError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Flattened domain events ─────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub phone_number_id: Option<String>,
    pub provider_message_id: String,
    pub status: RecipientStatus,
    pub occurred_at: Option<DateTime<Utc>>,
    pub recipient: Option<String>,
    pub error: Option<WebhookError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub phone_number_id: Option<String>,
    pub provider_message_id: String,
    pub from: String,
    pub profile_name: Option<String>,
    pub kind: String,
    pub body: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateStatusUpdate {
    pub provider_template_id: Option<String>,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: TemplateStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookEvents {
    pub statuses: Vec<StatusUpdate>,
    pub inbound: Vec<InboundMessage>,
    pub template_updates: Vec<TemplateStatusUpdate>,
}

impl WebhookEvents {
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty() && self.inbound.is_empty() && self.template_updates.is_empty()
    }
}

/// Provider timestamps are unix seconds as strings.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let secs = raw?.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

impl WebhookMessage {
    /// Text content of the message where one exists (text body, media caption,
    /// quick-reply button text).
    pub fn body(&self) -> Option<String> {
        let text = self.text.as_ref().map(|t| t.body.clone());
        let caption = [&self.image, &self.video, &self.document]
            .into_iter()
            .flatten()
            .find_map(|media| media.caption.clone());
        let button = self
            .button
            .as_ref()
            .and_then(|b| b.text.clone().or_else(|| b.payload.clone()));
        let interactive = self.interactive.as_ref().and_then(|value| {
            ["button_reply", "list_reply"]
                .iter()
                .find_map(|key| value.get(key)?.get("title")?.as_str().map(str::to_string))
        });
        text.or(caption)
            .or(button)
            .or(interactive)
            .filter(|body| !body.is_empty())
    }
}

impl WebhookPayload {
    pub fn events(&self) -> WebhookEvents {
        let mut events = WebhookEvents::default();
        for change in self.entry.iter().flat_map(|entry| entry.changes.iter()) {
            let value = &change.value;
            let phone_number_id = value
                .metadata
                .as_ref()
                .map(|m| m.phone_number_id.clone())
                .filter(|id| !id.is_empty());

            if change.field == "message_template_status_update" {
                if let Some(status) = value.event.as_deref().and_then(TemplateStatus::parse_provider) {
                    events.template_updates.push(TemplateStatusUpdate {
                        provider_template_id: value.message_template_id.as_ref().and_then(id_string),
                        name: value.message_template_name.clone(),
                        language: value.message_template_language.clone(),
                        status,
                        reason: value.reason.clone().filter(|r| !r.is_empty() && r != "NONE"),
                    });
                }
                continue;
            }

            for status in &value.statuses {
                let Some(mapped) = map_provider_status(&status.status) else {
                    continue;
                };
                events.statuses.push(StatusUpdate {
                    phone_number_id: phone_number_id.clone(),
                    provider_message_id: status.id.clone(),
                    status: mapped,
                    occurred_at: parse_timestamp(status.timestamp.as_deref()),
                    recipient: status.recipient_id.clone(),
                    error: status.errors.first().cloned(),
                });
            }

            for message in &value.messages {
                let profile_name = value
                    .contacts
                    .iter()
                    .find(|c| c.wa_id == message.from)
                    .or_else(|| value.contacts.first())
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone())
                    .filter(|name| !name.trim().is_empty());
                events.inbound.push(InboundMessage {
                    phone_number_id: phone_number_id.clone(),
                    provider_message_id: message.id.clone(),
                    from: message.from.clone(),
                    profile_name,
                    kind: normalize_kind(&message.kind),
                    body: message.body(),
                    occurred_at: parse_timestamp(message.timestamp.as_deref()),
                });
            }
        }
        events
    }
}

fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_kind(kind: &str) -> String {
    match kind {
        "text" | "image" | "document" | "audio" | "video" | "location" | "button"
        | "interactive" | "sticker" | "contacts" => kind.to_string(),
        _ => "other".to_string(),
    }
}

// ── Signatures ──────────────────────────────────────

/// `sha256=<hex hmac>` over the raw request body.
pub fn sign(app_secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(app_secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(provided) = header
        .map(str::trim)
        .and_then(|h| h.strip_prefix("sha256="))
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Idempotency key for a webhook delivery: the provider retries the exact
/// same body.
pub fn payload_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// GET subscription handshake.
pub fn verify_subscription(mode: Option<&str>, token: Option<&str>, expected: &str) -> bool {
    !expected.is_empty() && mode == Some("subscribe") && token == Some(expected)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKeyword {
    OptOut,
    OptIn,
}

pub fn opt_keyword(body: &str) -> Option<OptKeyword> {
    match body.trim().to_uppercase().as_str() {
        "STOP" | "UNSUBSCRIBE" => Some(OptKeyword::OptOut),
        "START" | "SUBSCRIBE" => Some(OptKeyword::OptIn),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_payload() -> serde_json::Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_ID",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "15550001111", "phone_number_id": "PN1"},
                        "statuses": [
                            {"id": "wamid.A", "status": "delivered", "timestamp": "1717232400", "recipient_id": "4915123456789"},
                            {"id": "wamid.B", "status": "failed", "timestamp": "1717232401", "recipient_id": "4915123456780",
                             "errors": [{"code": 131026, "title": "Message undeliverable"}]},
                            {"id": "wamid.C", "status": "deleted", "timestamp": "1717232402"}
                        ]
                    }
                }]
            }]
        })
    }

    #[test]
    fn statuses_are_flattened_and_unknown_dropped() {
        let payload: WebhookPayload = serde_json::from_value(status_payload()).unwrap();
        let events = payload.events();
        assert_eq!(events.statuses.len(), 2);
        let delivered = &events.statuses[0];
        assert_eq!(delivered.provider_message_id, "wamid.A");
        assert_eq!(delivered.status, RecipientStatus::Delivered);
        assert_eq!(delivered.phone_number_id.as_deref(), Some("PN1"));
        assert_eq!(delivered.occurred_at.unwrap().timestamp(), 1_717_232_400);
        let failed = &events.statuses[1];
        assert_eq!(failed.status, RecipientStatus::Failed);
        assert_eq!(failed.error.as_ref().unwrap().code, Some(131026));
    }

    #[test]
    fn inbound_messages_carry_profile_name_and_body() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "W", "changes": [{"field": "messages", "value": {
                "metadata": {"display_phone_number": "1555", "phone_number_id": "PN1"},
                "contacts": [{"wa_id": "4915123456789", "profile": {"name": "Ana"}}],
                "messages": [
                    {"id": "wamid.IN1", "from": "4915123456789", "timestamp": "1717232400", "type": "text", "text": {"body": "Hello"}},
                    {"id": "wamid.IN2", "from": "4915123456789", "timestamp": "1717232460", "type": "image", "image": {"id": "m1", "caption": "receipt"}},
                    {"id": "wamid.IN3", "from": "4915123456789", "timestamp": "1717232470", "type": "reaction"}
                ]
            }}]}]
        }))
        .unwrap();
        let events = payload.events();
        assert_eq!(events.inbound.len(), 3);
        assert_eq!(events.inbound[0].profile_name.as_deref(), Some("Ana"));
        assert_eq!(events.inbound[0].body.as_deref(), Some("Hello"));
        assert_eq!(events.inbound[1].kind, "image");
        assert_eq!(events.inbound[1].body.as_deref(), Some("receipt"));
        assert_eq!(events.inbound[2].kind, "other");
        assert_eq!(events.inbound[2].body, None);
    }

    #[test]
    fn interactive_reply_title_is_the_body() {
        let message: WebhookMessage = serde_json::from_value(json!({
            "id": "wamid.X", "from": "1", "type": "interactive",
            "interactive": {"type": "button_reply", "button_reply": {"id": "yes", "title": "Yes please"}}
        }))
        .unwrap();
        assert_eq!(message.body().as_deref(), Some("Yes please"));
    }

    #[test]
    fn template_status_updates_are_extracted() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "W", "changes": [{"field": "message_template_status_update", "value": {
                "event": "REJECTED",
                "message_template_id": 123456789,
                "message_template_name": "spring_sale",
                "message_template_language": "en_US",
                "reason": "INVALID_FORMAT"
            }}]}]
        }))
        .unwrap();
        let events = payload.events();
        assert_eq!(
            events.template_updates,
            vec![TemplateStatusUpdate {
                provider_template_id: Some("123456789".to_string()),
                name: Some("spring_sale".to_string()),
                language: Some("en_US".to_string()),
                status: TemplateStatus::Rejected,
                reason: Some("INVALID_FORMAT".to_string()),
            }]
        );
        assert!(events.statuses.is_empty());
    }

    #[test]
    fn empty_envelope_yields_no_events() {
        let payload: WebhookPayload = serde_json::from_value(json!({"object": "page"})).unwrap();
        assert!(payload.events().is_empty());
    }

    #[test]
    fn timestamps_parse_as_unix_seconds() {
        assert_eq!(parse_timestamp(Some("0")).unwrap().timestamp(), 0);
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn signature_roundtrip_and_tamper_detection() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let header = sign("s3cret", body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, Some(&header)));
        assert!(!verify_signature("other", body, Some(&header)));
        assert!(!verify_signature("s3cret", b"{}", Some(&header)));
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("sha1=abcd")));
        assert!(!verify_signature("s3cret", body, Some("sha256=not-hex")));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(payload_digest(b"abc"), payload_digest(b"abc"));
        assert_ne!(payload_digest(b"abc"), payload_digest(b"abd"));
        assert_eq!(payload_digest(b"").len(), 64);
    }

    #[test]
    fn subscription_handshake() {
        assert!(verify_subscription(Some("subscribe"), Some("tok"), "tok"));
        assert!(!verify_subscription(Some("subscribe"), Some("bad"), "tok"));
        assert!(!verify_subscription(Some("unsubscribe"), Some("tok"), "tok"));
        assert!(!verify_subscription(Some("subscribe"), Some(""), ""));
    }

    #[test]
    fn opt_keywords() {
        assert_eq!(opt_keyword(" stop "), Some(OptKeyword::OptOut));
        assert_eq!(opt_keyword("UNSUBSCRIBE"), Some(OptKeyword::OptOut));
        assert_eq!(opt_keyword("Start"), Some(OptKeyword::OptIn));
        assert_eq!(opt_keyword("please stop sending"), None);
    }
}
