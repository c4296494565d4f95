//! CLI utilities for binaries
//!
//! Handles configuration loading, environment variables and subscription
//! arguments for all binary executables.

use livelink::SubscriptionDescriptor;
use std::path::PathBuf;

/// Type of configuration to load
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// Realtime client settings (config/realtime.yaml)
    Realtime,
    /// Custom path
    Custom(String),
}

impl ConfigType {
    /// Get the default path for this config type
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Realtime => "config/realtime.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    /// Get the environment variable name for this config type
    pub fn env_var_name(&self) -> &str {
        "REALTIME_CONFIG_PATH"
    }
}

/// Load configuration path from environment or use default
///
/// A custom path always wins over the environment.
///
/// # Examples
/// ```
/// use gateway_realtime::bin_common::{load_config_from_env, ConfigType};
///
/// let path = load_config_from_env(ConfigType::Custom("local.yaml".into()));
/// assert_eq!(path.to_str(), Some("local.yaml"));
/// ```
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    if let ConfigType::Custom(path) = &config_type {
        return PathBuf::from(path);
    }
    std::env::var(config_type.env_var_name())
        .unwrap_or_else(|_| config_type.default_path().to_string())
        .into()
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

/// Parse a subscription argument
///
/// Accepted forms: `tag:<id>`, `tags:<id>,<id>`, `device:<id>`, `devices`
/// (all devices) and `alerts`.
pub fn parse_topic_arg(arg: &str) -> Option<SubscriptionDescriptor> {
    let (kind, value) = match arg.split_once(':') {
        Some((kind, value)) => (kind, Some(value.trim())),
        None => (arg, None),
    };

    match (kind.trim().to_ascii_lowercase().as_str(), value) {
        ("tag", Some(id)) if !id.is_empty() => Some(SubscriptionDescriptor::tag_stream(id)),
        ("tags", Some(ids)) => {
            let ids: Vec<&str> = ids.split(',').map(str::trim).filter(|id| !id.is_empty()).collect();
            if ids.is_empty() {
                None
            } else {
                Some(SubscriptionDescriptor::tag_streams(ids))
            }
        }
        ("device", Some(id)) if !id.is_empty() => Some(SubscriptionDescriptor::device_status(id)),
        ("devices", None) => Some(SubscriptionDescriptor::all_device_status()),
        ("alerts", None) => Some(SubscriptionDescriptor::alerts()),
        _ => None,
    }
}
