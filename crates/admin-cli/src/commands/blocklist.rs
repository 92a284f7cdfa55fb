use super::{api_client, check_ok, friendly_error};

async fn post_contact(api_url: &str, admin_token: &Option<String>, path: &str, contact: &str) -> anyhow::Result<serde_json::Value> {
    let client = api_client(admin_token);
    let url = format!("{api_url}{path}");
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "contact": contact }))
        .send()
        .await
        .map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    Ok(body)
}

pub async fn add(api_url: &str, admin_token: &Option<String>, contact: &str) -> anyhow::Result<()> {
    post_contact(api_url, admin_token, "/admin/blocklist/add", contact).await?;
    println!("Blocked {contact}.");
    Ok(())
}

pub async fn remove(api_url: &str, admin_token: &Option<String>, contact: &str) -> anyhow::Result<()> {
    post_contact(api_url, admin_token, "/admin/blocklist/remove", contact).await?;
    println!("Unblocked {contact}.");
    Ok(())
}

pub async fn check(api_url: &str, admin_token: &Option<String>, contact: &str) -> anyhow::Result<()> {
    let body = post_contact(api_url, admin_token, "/admin/blocklist/check", contact).await?;
    let blocked = body["blocked"].as_bool().unwrap_or(false);
    println!("{contact}: {}", if blocked { "blocked" } else { "not blocked" });
    Ok(())
}
