use super::{api_client, check_ok, friendly_error};

async fn post_queue(api_url: &str, admin_token: &Option<String>, path: &str, queue: &str) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}{path}");
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "queue": queue }))
        .send()
        .await
        .map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)
}

pub async fn pause(api_url: &str, admin_token: &Option<String>, queue: &str) -> anyhow::Result<()> {
    post_queue(api_url, admin_token, "/admin/queue/pause", queue).await?;
    println!("Queue '{queue}' paused.");
    Ok(())
}

pub async fn resume(api_url: &str, admin_token: &Option<String>, queue: &str) -> anyhow::Result<()> {
    post_queue(api_url, admin_token, "/admin/queue/resume", queue).await?;
    println!("Queue '{queue}' resumed.");
    Ok(())
}
