use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

/// Cursor-based pagination
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Cursor for the next page. None if this is the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether there are more results after this page
    pub has_more: bool,
}

impl<T: Serialize> PaginatedResponse<T> {
    /// Build a page from rows fetched with `limit + 1`. The extra row only
    /// signals `has_more`; the cursor points at the last row returned.
    pub fn from_rows<F>(mut rows: Vec<T>, limit: i64, key: F) -> Self
    where
        F: Fn(&T) -> (DateTime<Utc>, Uuid),
    {
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit.max(0) as usize);
        let next_cursor = if has_more {
            rows.last().map(|row| {
                let (timestamp, id) = key(row);
                encode_cursor(&timestamp, &id)
            })
        } else {
            None
        };
        PaginatedResponse {
            data: rows,
            next_cursor,
            has_more,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Cursor is base64("timestamp\0id"), opaque to the client and stable for pagination
pub fn encode_cursor(timestamp: &DateTime<Utc>, id: &Uuid) -> String {
    let raw = format!("{}\0{}", timestamp.to_rfc3339(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

pub fn decode_cursor(cursor: &str) -> Result<Cursor, CoreError> {
    let invalid = || CoreError::invalid("cursor", "use the next_cursor value from a previous response");

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid())?;
    let s = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (ts, id) = s.split_once('\0').ok_or_else(invalid)?;

    let timestamp = DateTime::parse_from_rfc3339(ts)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid())?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;

    Ok(Cursor { timestamp, id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_survives_encoding() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
        let id = Uuid::now_v7();
        let decoded = decode_cursor(&encode_cursor(&ts, &id)).unwrap();
        assert_eq!(decoded, Cursor { timestamp: ts, id });
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(decode_cursor("%%%").is_err());
        let no_separator = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("abc");
        assert!(decode_cursor(&no_separator).is_err());
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), 200);
        assert_eq!(clamp_limit(Some(25)), 25);
    }

    #[test]
    fn page_from_overfetched_rows_sets_cursor() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let rows: Vec<(DateTime<Utc>, Uuid)> = (0..3).map(|_| (ts, Uuid::now_v7())).collect();
        let last_kept = rows[1];
        let page = PaginatedResponse::from_rows(rows, 2, |r| *r);
        assert!(page.has_more);
        assert_eq!(page.data.len(), 2);
        let cursor = decode_cursor(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor.id, last_kept.1);
    }

    #[test]
    fn last_page_has_no_cursor() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let rows = vec![(ts, Uuid::now_v7())];
        let page = PaginatedResponse::from_rows(rows, 5, |r| *r);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }
}
