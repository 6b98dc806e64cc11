pub mod cleanup;
pub mod config_cmd;
pub mod gateway;
pub mod openai;
pub mod send;
pub mod status;

use chatrelay_browser::ChatRelay;
use chatrelay_core::{Config, Paths};
use std::sync::Arc;

/// Effective configuration (file plus environment) and a relay built on it.
pub(crate) fn load_relay() -> anyhow::Result<(Config, Arc<ChatRelay>)> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let relay = Arc::new(ChatRelay::from_config(&config, &paths));
    Ok((config, relay))
}
