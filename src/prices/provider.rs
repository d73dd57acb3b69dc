use super::{AssetClass, RawReading, UpstreamError};

/// Upstream source of raw prices, one asset class per call.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, class: AssetClass) -> Result<Vec<RawReading>, UpstreamError>;

    fn name(&self) -> &str;

    /// Upstream requests one `fetch` may issue in sequence, each bounded by the
    /// per-call timeout.
    fn requests_per_fetch(&self) -> u32 {
        1
    }
}
