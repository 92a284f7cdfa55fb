pub mod blocklist;
pub mod cache;
pub mod dlq;
pub mod queue;
pub mod stats;

/// Build a reqwest client, handling connection errors with a friendly message.
pub fn api_client(admin_token: &Option<String>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if let Some(token) = admin_token {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        builder = builder.default_headers(headers);
    }
    builder.build().unwrap_or_default()
}

/// Map common reqwest errors to user-friendly messages.
pub fn friendly_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() {
        anyhow::anyhow!(
            "Could not connect to the messaging gateway. Is it running?\n  \
             (hint: start it with `kiss-api` or check --api-url)"
        )
    } else if err.is_timeout() {
        anyhow::anyhow!("Request timed out. The gateway may be overloaded.")
    } else {
        anyhow::anyhow!("API request failed: {err}")
    }
}

/// Shared `{ok, error, message}` envelope returned by the admin HTTP surface.
pub fn check_ok(status: reqwest::StatusCode, body: &serde_json::Value) -> anyhow::Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let err_msg = body["message"].as_str().or_else(|| body["error"].as_str()).unwrap_or("unknown error");
    anyhow::bail!("request failed: {err_msg} (HTTP {status})")
}
