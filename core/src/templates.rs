//! WhatsApp message templates: categories, approval status, and `{{n}}`
//! placeholder handling.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CoreError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\d+)\s*\}\}").expect("placeholder regex is valid"));

pub const MAX_NAME_LEN: usize = 512;
pub const MAX_BODY_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Marketing,
    Utility,
    Authentication,
}

impl TemplateCategory {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.trim().to_lowercase().as_str() {
            "marketing" => Ok(TemplateCategory::Marketing),
            "utility" => Ok(TemplateCategory::Utility),
            "authentication" => Ok(TemplateCategory::Authentication),
            other => Err(CoreError::invalid(
                "category",
                format!("unknown template category '{other}'"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateCategory::Marketing => "marketing",
            TemplateCategory::Utility => "utility",
            TemplateCategory::Authentication => "authentication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Pending,
    Approved,
    Rejected,
    Paused,
    Disabled,
}

impl TemplateStatus {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Self::parse_provider(raw).ok_or_else(|| {
            CoreError::invalid("status", format!("unknown template status '{}'", raw.trim()))
        })
    }

    /// Map the gateway's `message_template_status_update` event names.
    pub fn parse_provider(event: &str) -> Option<Self> {
        match event.trim().to_uppercase().as_str() {
            "PENDING" | "IN_APPEAL" => Some(TemplateStatus::Pending),
            "APPROVED" => Some(TemplateStatus::Approved),
            "REJECTED" => Some(TemplateStatus::Rejected),
            "PAUSED" => Some(TemplateStatus::Paused),
            "DISABLED" | "PENDING_DELETION" => Some(TemplateStatus::Disabled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateStatus::Pending => "pending",
            TemplateStatus::Approved => "approved",
            TemplateStatus::Rejected => "rejected",
            TemplateStatus::Paused => "paused",
            TemplateStatus::Disabled => "disabled",
        }
    }

    pub fn is_sendable(self) -> bool {
        self == TemplateStatus::Approved
    }
}

pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::invalid("name", "template name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::invalid(
            "name",
            format!("template name must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(CoreError::invalid(
            "name",
            "template name may only contain lowercase letters, digits and underscores",
        ));
    }
    Ok(())
}

/// Validate a template body and return its placeholder count. Placeholders
/// must be numbered contiguously from `{{1}}`.
pub fn validate_body(body: &str) -> Result<usize, CoreError> {
    if body.trim().is_empty() {
        return Err(CoreError::invalid("body", "template body must not be empty"));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(CoreError::invalid(
            "body",
            format!("template body must be at most {MAX_BODY_LEN} characters"),
        ));
    }
    let indices = placeholder_indices(body)?;
    for (expected, actual) in (1..).zip(indices.iter()) {
        if *actual != expected {
            return Err(CoreError::invalid(
                "body",
                format!("placeholders must be numbered from {{{{1}}}} without gaps; missing {{{{{expected}}}}}"),
            ));
        }
    }
    Ok(indices.len())
}

pub fn placeholder_count(body: &str) -> usize {
    placeholder_indices(body)
        .ok()
        .and_then(|indices| indices.last().copied())
        .unwrap_or(0)
}

fn placeholder_indices(body: &str) -> Result<BTreeSet<usize>, CoreError> {
    PLACEHOLDER
        .captures_iter(body)
        .map(|caps| {
            caps[1]
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| CoreError::invalid("body", format!("invalid placeholder '{}'", &caps[0])))
        })
        .collect()
}

/// Substitute `{{n}}` with `params[n - 1]`.
pub fn render(body: &str, params: &[String]) -> Result<String, CoreError> {
    let needed = placeholder_count(body);
    if params.len() < needed {
        return Err(CoreError::invalid(
            "params",
            format!("template needs {needed} parameters, got {}", params.len()),
        ));
    }
    Ok(PLACEHOLDER
        .replace_all(body, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| params.get(n.wrapping_sub(1)))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(placeholder_count("Hi {{1}}, your order {{2}} shipped"), 2);
        assert_eq!(placeholder_count("Hi {{ 1 }}, again {{1}}"), 1);
        assert_eq!(placeholder_count("No variables"), 0);
    }

    #[test]
    fn body_with_gap_is_rejected() {
        assert_eq!(validate_body("Hi {{1}} and {{2}}").unwrap(), 2);
        assert!(validate_body("Hi {{1}} and {{3}}").is_err());
        assert!(validate_body("Hi {{2}}").is_err());
        assert!(validate_body("Hi {{0}}").is_err());
        assert!(validate_body("   ").is_err());
    }

    #[test]
    fn render_substitutes_in_order() {
        let out = render(
            "Hi {{1}}, your code is {{2}}. Bye {{1}}!",
            &["Ana".to_string(), "4711".to_string()],
        )
        .unwrap();
        assert_eq!(out, "Hi Ana, your code is 4711. Bye Ana!");
    }

    #[test]
    fn render_fails_on_missing_params() {
        let err = render("Hi {{1}} {{2}}", &["Ana".to_string()]).unwrap_err();
        assert!(err.to_string().contains("needs 2 parameters"));
    }

    #[test]
    fn names_follow_provider_rules() {
        assert!(validate_name("order_update_v2").is_ok());
        assert!(validate_name("Order Update").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(513)).is_err());
    }

    #[test]
    fn provider_events_map_to_status() {
        assert_eq!(TemplateStatus::parse_provider("APPROVED"), Some(TemplateStatus::Approved));
        assert_eq!(TemplateStatus::parse_provider("rejected"), Some(TemplateStatus::Rejected));
        assert_eq!(TemplateStatus::parse_provider("PAUSED"), Some(TemplateStatus::Paused));
        assert_eq!(TemplateStatus::parse_provider("FLAGGED"), None);
        assert!(TemplateStatus::Approved.is_sendable());
        assert!(!TemplateStatus::Paused.is_sendable());
    }

    #[test]
    fn category_parse() {
        assert_eq!(TemplateCategory::parse("Marketing").unwrap(), TemplateCategory::Marketing);
        assert!(TemplateCategory::parse("promo").is_err());
    }
}
