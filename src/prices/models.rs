use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Category of priced items sharing a provider mapping and a storage partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Currency,
    Gold,
    Silver,
}

impl AssetClass {
    /// Every class, in the order refresh outcomes are reported.
    pub const ALL: [AssetClass; 3] = [AssetClass::Currency, AssetClass::Gold, AssetClass::Silver];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Currency => "currency",
            AssetClass::Gold => "gold",
            AssetClass::Silver => "silver",
        }
    }

    /// Normalizes a code the way keys of this class are stored.
    pub fn normalize_code(&self, code: &str) -> String {
        match self {
            AssetClass::Currency => code.trim().to_uppercase(),
            AssetClass::Gold | AssetClass::Silver => code.trim().to_string(),
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "currency" | "currencies" => Ok(AssetClass::Currency),
            "gold" | "golds" => Ok(AssetClass::Gold),
            "silver" | "silvers" => Ok(AssetClass::Silver),
            other => Err(anyhow::anyhow!("Unknown asset class: {other}")),
        }
    }
}

/// Identifies one asset within its class, e.g. `(Currency, "USD")` or `(Gold, "Gram Altın")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetKey {
    pub class: AssetClass,
    pub code: String,
}

impl AssetKey {
    pub fn new(class: AssetClass, code: impl AsRef<str>) -> Self {
        Self {
            class,
            code: class.normalize_code(code.as_ref()),
        }
    }

    pub fn currency(code: impl AsRef<str>) -> Self {
        Self::new(AssetClass::Currency, code)
    }

    pub fn gold(name: impl AsRef<str>) -> Self {
        Self::new(AssetClass::Gold, name)
    }

    pub fn silver(name: impl AsRef<str>) -> Self {
        Self::new(AssetClass::Silver, name)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.code)
    }
}

/// Latest known state for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub key: AssetKey,
    pub name: String,
    pub value: Decimal,
    /// Change relative to the previous successful snapshot of the same key.
    pub change_percent: Decimal,
    pub fetched_at: DateTime<Utc>,
    /// False when the snapshot was seeded from the history store rather than fetched live.
    pub source_succeeded: bool,
    /// Set when refreshes for the class started failing; cleared by the next success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
    /// Daily change as reported by the provider, if it sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_change_percent: Option<Decimal>,
}

impl AssetSnapshot {
    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }
}

/// One persisted value of an asset. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub key: AssetKey,
    pub value: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// An unvalidated reading as the provider sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    pub code: String,
    pub name: String,
    pub raw_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_change: Option<String>,
}

impl RawReading {
    pub fn new(code: impl Into<String>, name: impl Into<String>, raw_value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            raw_value: raw_value.into(),
            raw_change: None,
        }
    }

    pub fn with_change(mut self, raw_change: impl Into<String>) -> Self {
        self.raw_change = Some(raw_change.into());
        self
    }
}

/// Monotonic counter bumped on every successful cache swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheGeneration(pub u64);

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Inclusive time bounds plus an optional cap on the number of newest points returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }

    /// Filters, sorts ascending and keeps the newest `limit` points.
    pub fn apply(&self, mut points: Vec<HistoryPoint>) -> Vec<HistoryPoint> {
        points.retain(|p| self.contains(p.recorded_at));
        points.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        if let Some(limit) = self.limit {
            if points.len() > limit {
                points.drain(..points.len() - limit);
            }
        }
        points
    }
}
