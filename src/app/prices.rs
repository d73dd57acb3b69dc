use anyhow::{Context, Result};
use serde::Serialize;

use super::Engine;
use crate::prices::{AssetClass, AssetKey, HistoryPoint, HistoryRange, RefreshOutcome};

#[derive(Serialize)]
pub struct RefreshOutput {
    pub seeded: usize,
    pub outcomes: Vec<RefreshOutcome>,
}

/// Seeds the cache from the store, then refreshes one class or all of them once.
pub async fn refresh_once(engine: &Engine, class: Option<AssetClass>) -> RefreshOutput {
    let seeded = engine.coordinator().warm_start().await;
    let outcomes = match class {
        Some(class) => vec![engine.coordinator().refresh(class).await],
        None => engine.scheduler().trigger_all().await,
    };
    RefreshOutput { seeded, outcomes }
}

pub async fn latest_values(engine: &Engine, class: AssetClass) -> Result<serde_json::Value> {
    let snapshots = engine
        .coordinator()
        .store()
        .load_latest(class)
        .await
        .with_context(|| format!("Failed to load latest {class} values"))?;
    Ok(serde_json::json!({
        "class": class,
        "count": snapshots.len(),
        "snapshots": snapshots,
    }))
}

#[derive(Serialize)]
pub struct HistoryOutput {
    pub key: AssetKey,
    pub points: Vec<HistoryPoint>,
}

pub async fn history(
    engine: &Engine,
    class: AssetClass,
    code: &str,
    limit: usize,
) -> Result<HistoryOutput> {
    let key = AssetKey::new(class, code);
    let points = engine
        .coordinator()
        .store()
        .query(&key, &HistoryRange::latest(limit))
        .await
        .with_context(|| format!("Failed to query history for {key}"))?;
    Ok(HistoryOutput { key, points })
}
