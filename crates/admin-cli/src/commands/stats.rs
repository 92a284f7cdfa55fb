use super::{api_client, check_ok, friendly_error};

/// Fetch `GET /admin/stats` and print queue depths.
pub async fn run(api_url: &str, admin_token: &Option<String>) -> anyhow::Result<()> {
    let client = api_client(admin_token);
    let url = format!("{api_url}/admin/stats");

    let resp = client.get(&url).send().await.map_err(friendly_error)?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(friendly_error)?;
    check_ok(status, &body)?;

    println!("kiss-api queue stats");
    println!("{}", "-".repeat(40));
    if let Some(queues) = body["queues"].as_object() {
        for (name, s) in queues {
            println!("{name}:");
            println!("  waiting:   {}", s["waiting"]);
            println!("  delayed:   {}", s["delayed"]);
            println!("  active:    {}", s["active"]);
            println!("  completed: {}", s["completed"]);
            println!("  failed:    {}", s["failed"]);
        }
    }
    Ok(())
}
