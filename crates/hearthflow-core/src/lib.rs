/*!
 * hearthflow Core
 *
 * This crate provides the shared foundation for hearthflow: configuration,
 * logging, the typed event bus, error types and async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// hearthflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("hearthflow core {} initialized", VERSION);
    Ok(())
}
