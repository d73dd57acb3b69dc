use std::path::Path;

use crate::config::ResolvedConfig;
use crate::duration::format_duration;

pub fn config_output(config_path: &Path, config: &ResolvedConfig) -> serde_json::Value {
    serde_json::json!({
        "config_file": config_path.display().to_string(),
        "data_directory": config.data_dir.display().to_string(),
        "refresh": {
            "interval": format_duration(config.refresh.interval),
            "jitter": format_duration(config.refresh.jitter),
            "cycle_timeout": format_duration(config.refresh.cycle_timeout),
            "provider_timeout": format_duration(config.refresh.provider_timeout),
            "store_timeout": format_duration(config.refresh.store_timeout),
            "refresh_on_start": config.refresh.refresh_on_start
        },
        "retry": config.retry,
        "circuit_breaker": config.circuit_breaker,
        "provider": config.provider,
        "server": config.server
    })
}
