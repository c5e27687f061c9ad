//! Implementation of `zephyr trigger`: POST a run to a running server.

use anyhow::Context;
use serde_json::json;

pub async fn trigger(
    api_url: &str,
    project: &str,
    pipeline: &str,
    branch: Option<String>,
    api_key: Option<String>,
) -> anyhow::Result<i32> {
    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("{api_url}/api/v1/trigger"))
        .json(&json!({
            "project": project,
            "pipeline": pipeline,
            "branch": branch,
        }));
    if let Some(key) = api_key {
        request = request.header("X-API-Key", key);
    }

    let response = request.send().await.context("request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        eprintln!("trigger failed ({status}): {body}");
        return Ok(1);
    }

    let body: serde_json::Value = response.json().await?;
    println!("{}", body["id"].as_str().unwrap_or_default());
    Ok(0)
}
