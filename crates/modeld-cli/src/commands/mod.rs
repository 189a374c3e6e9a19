//! CLI commands implementation

use anyhow::{Context, Result};
use modeld_core::Endpoint;
use modeld_network::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// API client for one or more workers
pub struct ApiClient {
    router: Router,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(apis: &[String]) -> Result<Self> {
        let endpoints = apis
            .iter()
            .map(|api| Endpoint::parse(api).with_context(|| format!("invalid --api '{}'", api)))
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            anyhow::bail!("at least one --api address is required");
        }
        Ok(Self {
            router: Router::new(endpoints),
            client: reqwest::Client::new(),
        })
    }

    /// Worker responsible for `name`
    pub fn endpoint_for(&self, name: &str) -> Result<&Endpoint> {
        self.router
            .resolve(name)
            .with_context(|| format!("no worker for '{}'", name))
    }

    /// URL of an entity route on the entity's worker
    pub fn model_url(&self, name: &str, action: &str) -> Result<String> {
        let endpoint = self.endpoint_for(name)?;
        let url = format!("{}/api/v1/models/{}/{}", endpoint.url(), name, action);
        debug!(name = name, url = %url, "Routed request");
        Ok(url)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.router.endpoints()
    }
}

/// Error body returned by a worker
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Turn a non-success response into an error
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await?;
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => anyhow::bail!("{} ({}): {}", body.error, status, body.message),
        Err(_) => anyhow::bail!("request failed ({}): {}", status, text),
    }
}

/// Parse a command-line JSON value
pub fn parse_json_arg(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON: {}", what, raw))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run one input through an entity's model
pub async fn run(client: &ApiClient, name: &str, input: &str, model: Option<String>) -> Result<()> {
    let body = json!({
        "model": model,
        "input": parse_json_arg(input, "input")?,
    });

    let response = client
        .client
        .post(client.model_url(name, "run")?)
        .json(&body)
        .send()
        .await?;
    let output: Value = check(response).await?.json().await?;
    print_json(&output)
}

/// Download an entity's snapshot
pub async fn get_model(client: &ApiClient, name: &str, output: Option<PathBuf>) -> Result<()> {
    let response = client
        .client
        .get(client.model_url(name, "snapshot")?)
        .send()
        .await?;
    let bytes = check(response).await?.bytes().await?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Snapshot of '{}' written to {}", name, path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

/// Upload a snapshot for an entity
pub async fn put_model(client: &ApiClient, name: &str, file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let response = client
        .client
        .put(client.model_url(name, "snapshot")?)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(bytes)
        .send()
        .await?;
    let meta: Value = check(response).await?.json().await?;
    println!(
        "Snapshot installed for '{}' (generation {})",
        name, meta["generation"]
    );
    Ok(())
}

/// Snapshot one entity
pub async fn save_model(client: &ApiClient, name: &str) -> Result<()> {
    let response = client
        .client
        .post(client.model_url(name, "save")?)
        .send()
        .await?;
    let meta: Value = check(response).await?.json().await?;
    println!("Saved '{}' (generation {})", name, meta["generation"]);
    Ok(())
}

/// Snapshot every dirty entity on every worker
pub async fn save_models(client: &ApiClient, evicted: bool) -> Result<()> {
    for endpoint in client.endpoints() {
        let mut url = format!("{}/api/v1/models/save", endpoint.url());
        if evicted {
            url.push_str("?evicted=true");
        }
        let response = client.client.post(url).send().await?;
        let report: Value = check(response).await?.json().await?;
        let flushed = report["flushed"].as_array().map_or(0, |a| a.len());
        println!("{}: {} entities saved", endpoint, flushed);
    }
    Ok(())
}

/// Discard an entity's state
pub async fn reset_model(client: &ApiClient, name: &str, params: Option<String>) -> Result<()> {
    let mut request = client.client.post(client.model_url(name, "reset")?);
    if let Some(raw) = params {
        let params = parse_json_arg(&raw, "params")?;
        request = request.json(&json!({ "parameters": params }));
    }

    check(request.send().await?).await?;
    println!("Entity '{}' reset", name);
    Ok(())
}

/// Change an entity's auto-save delay
pub async fn set_save_delay(client: &ApiClient, name: &str, seconds: u64) -> Result<()> {
    let response = client
        .client
        .put(client.model_url(name, "save_delay")?)
        .json(&json!({ "save_delay": seconds }))
        .send()
        .await?;
    check(response).await?;
    println!("Save delay of '{}' set to {}s", name, seconds);
    Ok(())
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub queue_open: bool,
    pub cache: CacheStats,
    pub pending: Vec<String>,
    #[serde(default)]
    pub stored_entities: usize,
    #[serde(default)]
    pub retention: usize,
    pub kinds: Vec<String>,
    pub default_model: String,
    pub checkpoint_root: String,
}

#[derive(Debug, Deserialize)]
pub struct CacheStats {
    pub resident: usize,
    pub capacity: usize,
    pub dirty: usize,
    pub in_use: usize,
    pub pending: usize,
    #[serde(default)]
    pub discarded: u64,
    #[serde(default)]
    pub lost_changes: u64,
}

/// Show every worker's status
pub async fn status(client: &ApiClient) -> Result<()> {
    for endpoint in client.endpoints() {
        let response = client
            .client
            .get(format!("{}/api/v1/status", endpoint.url()))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                eprintln!("{}: unreachable ({})", endpoint, e);
                continue;
            }
        };
        let status: StatusResponse = check(response).await?.json().await?;

        println!("{} - modeld v{}", endpoint, status.version);
        println!(
            "  Queue: {}",
            if status.queue_open { "open" } else { "closed" }
        );
        println!(
            "  Resident: {}/{} ({} dirty, {} in use)",
            status.cache.resident, status.cache.capacity, status.cache.dirty, status.cache.in_use
        );
        println!("  Awaiting write-back: {}", status.cache.pending);
        if !status.pending.is_empty() {
            println!("    {}", status.pending.join(", "));
        }
        println!(
            "  Model kinds: {} (default {})",
            status.kinds.join(", "),
            status.default_model
        );
        if status.cache.discarded > 0 {
            println!(
                "  Lost before write-back: {} models ({} unsaved changes)",
                status.cache.discarded, status.cache.lost_changes
            );
        }
        println!(
            "  Checkpoints: {} ({} entities, {} generations kept)",
            status.checkpoint_root, status.stored_entities, status.retention
        );
    }
    Ok(())
}

/// Show which worker serves an entity
pub fn route(client: &ApiClient, name: &str) -> Result<()> {
    println!("{} -> {}", name, client.endpoint_for(name)?);
    Ok(())
}
