use super::{api_client, check_ok, friendly_error};

/// `POST /admin/cache/clear`.
pub async fn clear(api_url: &str, admin_token: &Option<String>) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/cache/clear");
    let resp = client.post(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    println!("Conversation history cache cleared.");
    Ok(())
}
