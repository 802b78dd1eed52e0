/*!
 * Prelude module for hearthflow core.
 *
 * Re-exports the types and functions most crates in the workspace need.
 */

pub use crate::config::{
    BrokerConfig, CommandConfig, Config, ConfigBuilder, LoggingConfig, SharedConfig,
};
pub use crate::error::{Error, Result};
pub use crate::event::{EventBus, SharedEventBus};
pub use crate::types::{unix_timestamp, Id};
pub use crate::utils::{spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
