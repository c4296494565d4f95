//! Gateway Realtime - Main Library
//!
//! Application composition on top of the `livelink` client: settings,
//! logging, a queryable live store and helpers for the binaries.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, runners)
//! - **settings**: YAML settings, presets and environment overrides
//! - **logging**: tracing subscriber initialisation
//! - **store**: latest-value cache fed by client listeners
//! - **livelink**: real-time client library (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use gateway_realtime::bin_common::{load_config_from_env, ConfigType};
//! use gateway_realtime::settings::RealtimeSettings;
//! ```

// Re-export workspace libraries for convenience
pub use livelink;

pub mod logging;
pub mod settings;
pub mod store;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_config_from_env, parse_args, parse_topic_arg, ConfigType};
    pub use runner::{interruptible_sleep, BinaryRunner, RunConfig};
}
