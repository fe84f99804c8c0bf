/// TOML configuration file
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{Config, Defaults, DiskConfig, EmailAlertConfig, LogConfig};
