//! Contact identity helpers. Phone numbers are the join key between our
//! contacts and the gateway's `wa_id`, so every write path normalizes them.

use crate::error::CoreError;

/// Normalize a user-entered phone number to E.164 (`+` followed by 8-15 digits).
///
/// Accepts spaces, dashes, dots and parentheses as separators and either a
/// leading `+` or an international `00` prefix.
pub fn normalize_phone(raw: &str) -> Result<String, CoreError> {
    let trimmed = raw.trim();
    let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let mut digits = String::with_capacity(without_plus.len());
    for c in without_plus.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(CoreError::invalid(
                    "phone",
                    format!("unexpected character '{c}' in phone number"),
                ));
            }
        }
    }

    let digits = if !trimmed.starts_with('+') {
        digits.strip_prefix("00").map(str::to_string).unwrap_or(digits)
    } else {
        digits
    };

    if !(8..=15).contains(&digits.len()) {
        return Err(CoreError::invalid(
            "phone",
            "phone number must have 8 to 15 digits including country code",
        ));
    }
    if digits.starts_with('0') {
        return Err(CoreError::invalid(
            "phone",
            "phone number must start with a country code",
        ));
    }

    Ok(format!("+{digits}"))
}

/// The gateway addresses recipients by digits only.
pub fn wa_id(e164: &str) -> &str {
    e164.strip_prefix('+').unwrap_or(e164)
}

pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_formats() {
        assert_eq!(normalize_phone("+49 151 2345-6789").unwrap(), "+4915123456789");
        assert_eq!(normalize_phone("0049 (151) 23456789").unwrap(), "+4915123456789");
        assert_eq!(normalize_phone("15551234567").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("  +1.555.123.4567 ").unwrap(), "+15551234567");
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+1234567890123456").is_err());
        assert!(normalize_phone("+49 151 abc").is_err());
        assert!(normalize_phone("0151 23456789").is_err());
    }

    #[test]
    fn wa_id_strips_plus() {
        assert_eq!(wa_id("+4915123456789"), "4915123456789");
        assert_eq!(wa_id("4915123456789"), "4915123456789");
    }

    #[test]
    fn tags_are_trimmed_lowercased_and_deduped() {
        let tags = normalize_tags(vec![
            " VIP ".to_string(),
            "newsletter".to_string(),
            "vip".to_string(),
            "  ".to_string(),
        ]);
        assert_eq!(tags, vec!["newsletter".to_string(), "vip".to_string()]);
    }
}
