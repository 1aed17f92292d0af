use clap::Args;

use crate::util::{api_request, exit_error, read_json_from_file, require_token};

#[derive(Args)]
pub struct ApiArgs {
    /// HTTP method (GET, POST, PUT, DELETE, PATCH)
    pub method: String,

    /// API path (e.g. /v1/contacts)
    pub path: String,

    /// Request body as JSON string
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Read request body from file (use '-' for stdin)
    #[arg(long, short = 'f', conflicts_with = "data")]
    pub data_file: Option<String>,

    /// Query parameters (repeatable: key=value)
    #[arg(long, short = 'q')]
    pub query: Vec<String>,

    /// Skip authentication (for public endpoints like /health)
    #[arg(long)]
    pub no_auth: bool,
}

fn parse_method(raw: &str) -> Option<reqwest::Method> {
    match raw.to_uppercase().as_str() {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "DELETE" => Some(reqwest::Method::DELETE),
        "PATCH" => Some(reqwest::Method::PATCH),
        _ => None,
    }
}

fn parse_query(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|q| {
            q.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("Invalid query parameter: '{q}'"))
        })
        .collect()
}

pub async fn run(api_url: &str, args: ApiArgs) -> i32 {
    let method = parse_method(&args.method).unwrap_or_else(|| {
        exit_error(
            &format!("Unknown HTTP method: {}", args.method),
            Some("Supported methods: GET, POST, PUT, DELETE, PATCH"),
        )
    });

    let query = parse_query(&args.query)
        .unwrap_or_else(|e| exit_error(&e, Some("Format: key=value, e.g. --query status=sent")));

    let body = if let Some(ref d) = args.data {
        match serde_json::from_str(d) {
            Ok(v) => Some(v),
            Err(e) => exit_error(
                &format!("Invalid JSON in --data: {e}"),
                Some("Provide valid JSON string"),
            ),
        }
    } else if let Some(ref f) = args.data_file {
        match read_json_from_file(f) {
            Ok(v) => Some(v),
            Err(e) => exit_error(&e, Some("Provide a valid JSON file or use '-' for stdin")),
        }
    } else {
        None
    };

    let token = (!args.no_auth).then(|| require_token(api_url));

    api_request(api_url, method, &args.path, token.as_deref(), body, &query).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_requires_key_value_pairs() {
        let parsed = parse_query(&["status=sent".to_string(), "limit=5".to_string()]).unwrap();
        assert_eq!(parsed[0], ("status".to_string(), "sent".to_string()));
        assert_eq!(parsed[1], ("limit".to_string(), "5".to_string()));
        assert!(parse_query(&["status".to_string()]).is_err());
    }

    #[test]
    fn methods_are_case_insensitive() {
        for m in ["get", "GET", "Post", "delete", "put", "patch"] {
            assert!(parse_method(m).is_some(), "Failed to parse method: {m}");
        }
        assert!(parse_method("TRACE").is_none());
    }
}
