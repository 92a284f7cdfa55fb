use super::{api_client, check_ok, friendly_error};

pub async fn list(api_url: &str, admin_token: &Option<String>, page_size: usize) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/dlq?page_size={page_size}");
    let resp = client.get(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;

    let entries = body["entries"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("Dead letter queue is empty.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  queue={}  moved_at={}  error={}",
            entry["dlq_job_id"].as_str().unwrap_or("?"),
            entry["job"]["queue"].as_str().unwrap_or("?"),
            entry["moved_at"].as_str().unwrap_or("?"),
            entry["error"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

pub async fn retry(api_url: &str, admin_token: &Option<String>, id: &str) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/dlq/retry/{id}");
    let resp = client.post(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    println!("Retried {id} as job {}.", body["job_id"].as_str().unwrap_or("?"));
    Ok(())
}

pub async fn retry_all(api_url: &str, admin_token: &Option<String>) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/dlq/retry-all");
    let resp = client.post(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    let count = body["job_ids"].as_array().map(|a| a.len()).unwrap_or(0);
    println!("Retried {count} dead-lettered job(s).");
    Ok(())
}

pub async fn discard(api_url: &str, admin_token: &Option<String>, id: &str) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/dlq/{id}");
    let resp = client.delete(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    println!("Discarded {id}.");
    Ok(())
}

pub async fn clear_all(api_url: &str, admin_token: &Option<String>, confirmation_token: &str) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/dlq");
    let resp = client
        .delete(&url)
        .json(&serde_json::json!({ "confirmation_token": confirmation_token }))
        .send()
        .await
        .map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;
    println!("Cleared {} dead-lettered job(s).", body["cleared"].as_u64().unwrap_or(0));
    Ok(())
}
