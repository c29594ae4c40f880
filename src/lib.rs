//! Declarative data export engine.
//!
//! Hosts register [`ExportDefinition`]s and row sources, then drive exports
//! through [`ExportService`] directly or through the transport-agnostic
//! [`ExportHandler`].

use std::sync::Once;

// Public modules
pub mod auth;
pub mod config;
pub mod domains;
pub mod errors;

// Private modules
mod utils;

pub use auth::{Actor, Scope};
pub use config::EngineConfig;
pub use domains::export::{
    ExportContext, ExportDefinition, ExportHandler, ExportRequest, ExportService, Format, Runner,
};
pub use errors::{ErrorKind, ExportError, ExportResult};

static LOGGING: Once = Once::new();

/// Installs `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
/// Safe to call more than once; a logger installed by the host wins.
pub fn initialize_logging() {
    LOGGING.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("info");
        if env_logger::Builder::from_env(env).try_init().is_err() {
            log::debug!("logger already installed");
        }
    });
}
