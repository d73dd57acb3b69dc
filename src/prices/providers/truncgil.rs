//! Truncgil "today" feed (finans.truncgil.com).
//!
//! One JSON document carries every currency, gold format and silver, keyed by asset
//! code, plus an `Update_Date` string. The V4 feed is the primary source; the V3 feed
//! uses different keys for gold and silver and is used as a fallback.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::prices::{AssetClass, PriceSource, RawReading, UpstreamError};

const PROVIDER_NAME: &str = "truncgil";
const PRIMARY_URL: &str = "https://finans.truncgil.com/v4/today.json";
const FALLBACK_URL: &str = "https://finans.truncgil.com/v3/today.json";

const CURRENCY_CODES: [&str; 15] = [
    "USD", "EUR", "GBP", "JPY", "CHF", "CNY", "CAD", "AUD", "DKK", "SEK", "NOK", "SAR", "QAR",
    "KWD", "AED",
];

/// Gold formats by display name, with every key the V3 and V4 feeds use for them.
const GOLD_FORMATS: [(&str, &[&str]); 5] = [
    ("Gram Altın", &["GRA", "gram-altin", "gram_altin", "GRAM"]),
    (
        "Çeyrek Altın",
        &["CEYREKALTIN", "ceyrek-altin", "ceyrek_altin", "CEYREK"],
    ),
    ("Yarım Altın", &["YARIMALTIN", "yarim-altin", "yarim_altin", "YARIM"]),
    ("Tam Altın", &["TAMALTIN", "tam-altin", "tam_altin", "TAM"]),
    (
        "Cumhuriyet Altını",
        &[
            "CUMHURIYETALTINI",
            "cumhuriyet-altini",
            "cumhuriyet_altini",
            "CUMHURIYET",
        ],
    ),
];

const SILVER_NAME: &str = "Gümüş";
const SILVER_KEYS: [&str; 5] = ["GUMUS", "gumus", "silver", "SILVER", "gümüş"];

fn default_primary_url() -> String {
    PRIMARY_URL.to_string()
}

fn default_fallback_url() -> Option<String> {
    Some(FALLBACK_URL.to_string())
}

fn default_user_agent() -> String {
    format!("kurabak/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncgilConfig {
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    /// Tried when the primary fails for any reason. Empty or absent disables the fallback.
    #[serde(default = "default_fallback_url")]
    pub fallback_url: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TruncgilConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            fallback_url: default_fallback_url(),
            user_agent: default_user_agent(),
        }
    }
}

/// One asset entry of the feed. Values arrive as Turkish-formatted strings or numbers.
#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(rename = "Selling", default)]
    selling: Option<Value>,
    #[serde(rename = "Change", default)]
    change: Option<Value>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Type", default)]
    kind: Option<String>,
}

pub struct TruncgilSource {
    client: Client,
    config: TruncgilConfig,
    timeout: Duration,
}

impl TruncgilSource {
    /// Builds the source with its own HTTP client; `timeout` bounds each request.
    pub fn new(config: TruncgilConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            timeout,
        })
    }

    pub fn config(&self) -> &TruncgilConfig {
        &self.config
    }

    fn fallback_url(&self) -> Option<&str> {
        self.config.fallback_url.as_deref().filter(|url| !url.is_empty())
    }

    async fn fetch_document(&self, url: &str) -> Result<Map<String, Value>, UpstreamError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                provider: PROVIDER_NAME.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_request_error(e))?;
        let document: Map<String, Value> =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::Decode {
                provider: PROVIDER_NAME.to_string(),
                message: e.to_string(),
            })?;

        if let Some(updated) = document.get("Update_Date").and_then(Value::as_str) {
            debug!(url, update_date = updated, "truncgil document fetched");
        }
        Ok(document)
    }

    fn map_request_error(&self, err: reqwest::Error) -> UpstreamError {
        let provider = PROVIDER_NAME.to_string();
        if err.is_timeout() {
            UpstreamError::Timeout {
                provider,
                secs: self.timeout.as_secs(),
            }
        } else if let Some(status) = err.status() {
            UpstreamError::Status {
                provider,
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            UpstreamError::Decode {
                provider,
                message: err.to_string(),
            }
        } else {
            UpstreamError::Network {
                provider,
                message: err.to_string(),
            }
        }
    }

    async fn fetch_from(
        &self,
        url: &str,
        class: AssetClass,
    ) -> Result<Vec<RawReading>, UpstreamError> {
        let document = self.fetch_document(url).await?;
        let readings = extract_readings(&document, class);
        if readings.is_empty() {
            return Err(UpstreamError::MissingData {
                provider: PROVIDER_NAME.to_string(),
                class,
            });
        }
        Ok(readings)
    }
}

#[async_trait::async_trait]
impl PriceSource for TruncgilSource {
    async fn fetch(&self, class: AssetClass) -> Result<Vec<RawReading>, UpstreamError> {
        let primary_err = match self.fetch_from(&self.config.primary_url, class).await {
            Ok(readings) => return Ok(readings),
            Err(err) => err,
        };

        let Some(fallback_url) = self.fallback_url() else {
            return Err(primary_err);
        };
        warn!(class = %class, error = %primary_err, "primary feed failed, trying fallback");

        match self.fetch_from(fallback_url, class).await {
            Ok(readings) => {
                info!(class = %class, readings = readings.len(), "fallback feed answered");
                Ok(readings)
            }
            Err(fallback_err) => {
                warn!(class = %class, error = %fallback_err, "fallback feed failed too");
                if !primary_err.is_transient() && fallback_err.is_transient() {
                    Err(fallback_err)
                } else {
                    Err(primary_err)
                }
            }
        }
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn requests_per_fetch(&self) -> u32 {
        if self.fallback_url().is_some() {
            2
        } else {
            1
        }
    }
}

fn find_item<'k>(document: &Map<String, Value>, keys: &[&'k str]) -> Option<(&'k str, FeedItem)> {
    keys.iter().find_map(|&key| {
        let item = serde_json::from_value(document.get(key)?.clone()).ok()?;
        Some((key, item))
    })
}

fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn reading(code: &str, name: &str, item: &FeedItem) -> RawReading {
    let reading = RawReading::new(
        code,
        name,
        value_text(item.selling.as_ref()).unwrap_or_default(),
    );
    match value_text(item.change.as_ref()) {
        Some(change) => reading.with_change(change),
        None => reading,
    }
}

/// Picks the readings of `class` out of a feed document.
fn extract_readings(document: &Map<String, Value>, class: AssetClass) -> Vec<RawReading> {
    match class {
        AssetClass::Currency => CURRENCY_CODES
            .iter()
            .filter_map(|&code| {
                let lower = code.to_lowercase();
                let Some((_, item)) = find_item(document, &[code, lower.as_str()]) else {
                    warn!(code, "currency missing from feed");
                    return None;
                };
                // V3 items may omit the type entirely.
                if let Some(kind) = item.kind.as_deref().filter(|k| *k != "Currency") {
                    warn!(code, kind, "skipping feed item with unexpected type");
                    return None;
                }
                let name = item.name.clone().unwrap_or_else(|| code.to_string());
                Some(reading(code, &name, &item))
            })
            .collect(),
        AssetClass::Gold => GOLD_FORMATS
            .iter()
            .filter_map(|&(name, keys)| match find_item(document, keys) {
                Some((key, item)) => {
                    debug!(name, key, "gold format found");
                    Some(reading(name, name, &item))
                }
                None => {
                    warn!(name, "gold format missing from feed");
                    None
                }
            })
            .collect(),
        AssetClass::Silver => match find_item(document, &SILVER_KEYS) {
            Some((_, item)) => vec![reading(SILVER_NAME, SILVER_NAME, &item)],
            None => {
                warn!("silver missing from feed");
                Vec::new()
            }
        },
    }
}
