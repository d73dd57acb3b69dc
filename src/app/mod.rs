mod config;
mod engine;
mod prices;

pub use config::config_output;
pub use engine::Engine;
pub use prices::{history, latest_values, refresh_once, HistoryOutput, RefreshOutput};
