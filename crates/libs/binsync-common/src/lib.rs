//! Ambient stack shared by the binsync workspace: configuration loading
//! and tracing/logging setup. Domain logic lives in `binsync-core`.

pub mod config;
pub mod error;

#[path = "tracing.rs"]
pub mod logging;

pub use config::BinsyncConfig;
pub use error::{CommonError, Result};
