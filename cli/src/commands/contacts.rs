use clap::Subcommand;
use serde_json::json;

use crate::util::{
    EXIT_CONNECTION_ERROR, EXIT_OK, api_request, exit_code_for_status, exit_error, print_json,
    query_pairs, read_json_from_file, require_token, send_request,
};

/// Server-side cap on one batch upsert.
const IMPORT_CHUNK: usize = 500;

#[derive(Subcommand)]
pub enum ContactCommands {
    /// List contacts
    List {
        /// Search phone, name or email
        #[arg(long)]
        q: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Upsert contacts from a JSON array of {phone, name?, email?, tags?, attributes?}
    Import {
        /// JSON file (use '-' for stdin)
        #[arg(long)]
        file: String,
    },
}

pub async fn run(api_url: &str, command: ContactCommands) -> i32 {
    let token = require_token(api_url);
    match command {
        ContactCommands::List { q, tag, limit, cursor } => {
            let query = query_pairs(&[
                ("q", q),
                ("tag", tag),
                ("limit", limit.map(|l| l.to_string())),
                ("cursor", cursor),
            ]);
            api_request(api_url, reqwest::Method::GET, "/v1/contacts", Some(&token), None, &query)
                .await
        }
        ContactCommands::Import { file } => import(api_url, &token, &file).await,
    }
}

async fn import(api_url: &str, token: &str, file: &str) -> i32 {
    let contacts = match read_json_from_file(file) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(_) => exit_error("Import file must contain a JSON array", None),
        Err(e) => exit_error(&e, Some("Provide a JSON array file or use '-' for stdin")),
    };
    if contacts.is_empty() {
        exit_error("Import file contains no contacts", None);
    }

    let mut created = 0u64;
    let mut updated = 0u64;
    let mut rejected = Vec::new();

    for (chunk_no, chunk) in contacts.chunks(IMPORT_CHUNK).enumerate() {
        let offset = chunk_no * IMPORT_CHUNK;
        let body = json!({ "contacts": chunk });
        let (status, resp) = match send_request(
            api_url,
            reqwest::Method::POST,
            "/v1/contacts/batch",
            Some(token),
            Some(&body),
            &[],
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                eprintln!("{}", json!({ "error": "connection_error", "message": e, "imported_before_failure": created + updated }));
                return EXIT_CONNECTION_ERROR;
            }
        };

        let code = exit_code_for_status(status);
        if code != EXIT_OK {
            eprintln!("{}", json!({ "failed_chunk_offset": offset, "response": resp }));
            return code;
        }

        created += resp["created"].as_u64().unwrap_or(0);
        updated += resp["updated"].as_u64().unwrap_or(0);
        if let Some(items) = resp["rejected"].as_array() {
            rejected.extend(items.iter().map(|item| shift_index(item, offset)));
        }
    }

    print_json(&json!({
        "created": created,
        "updated": updated,
        "rejected": rejected
    }));
    EXIT_OK
}

/// Rejections index into their chunk; report positions in the whole file.
fn shift_index(item: &serde_json::Value, offset: usize) -> serde_json::Value {
    let mut item = item.clone();
    if let Some(index) = item["index"].as_u64() {
        item["index"] = json!(index + offset as u64);
    }
    item
}

#[cfg(test)]
mod tests {
    use super::shift_index;
    use serde_json::json;

    #[test]
    fn rejection_indexes_are_file_positions() {
        let item = json!({ "index": 3, "field": "phone", "message": "invalid" });
        let shifted = shift_index(&item, 500);
        assert_eq!(shifted["index"], 503);
        assert_eq!(shifted["field"], "phone");
    }
}
