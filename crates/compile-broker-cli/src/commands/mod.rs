//! Subcommand implementations

pub mod config;
pub mod directives;
pub mod simulate;

use anyhow::Context;
use compile_broker::BrokerConfig;
use std::path::Path;

/// Load `path`, or the built-in defaults
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<BrokerConfig> {
    match path {
        Some(path) => BrokerConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(BrokerConfig::default()),
    }
}
