//! Configuration-loading helpers shared by the orchestrator binary and its
//! tests: environment-variable lookups, YAML/JSON config file loading, and
//! the `FromEnv`/`ValidateConfig` traits `OrchestratorConfig` builds on.
//!
//! ```rust,ignore
//! use utils::config::{get_env, get_env_parse, load_config_file};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct AppConfig {
//!     api_key: String,
//!     port: u16,
//! }
//!
//! let api_key = get_env("API_KEY")?;
//! let port = get_env_parse::<u16>("PORT")?;
//! let config: AppConfig = load_config_file("config.yaml")?;
//! ```

pub mod config;
pub mod error;

pub use error::{Result, UtilsError};

pub use config::{
    get_env, get_env_bool, get_env_bool_or, get_env_or, get_env_parse, get_env_parse_or,
    load_config_file, load_json_config, load_yaml_config, ConfigBuilder, FromEnv, ValidateConfig,
};

