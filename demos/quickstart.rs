use anyhow::{Context, Result};
use screen_copilot::agent::DiskSnapshotStore;
use screen_copilot::{LlmClient, LlmConfig, Screenshot, SessionDriver};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let image_path = args.next().context("usage: quickstart <screenshot.png> <goal>")?;
    let goal = args.collect::<Vec<_>>().join(" ");

    let bytes = tokio::fs::read(&image_path)
        .await
        .with_context(|| format!("could not read {}", image_path))?;

    // One client serves both calls; clones share the connection pool.
    let client = LlmClient::new(LlmConfig::default())?;
    tracing::info!(
        planner = %client.config().planner_model,
        locator = %client.config().locator_model,
        "models selected"
    );
    let runs_dir = std::env::temp_dir().join("screen_copilot_runs");
    let driver = SessionDriver::with_defaults(client.clone(), client)
        .with_snapshot_store(Arc::new(DiskSnapshotStore::new(&runs_dir)));

    let response = driver.initialize(&goal, Screenshot::from(bytes)).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}
