//! Flashboard Common Library
//!
//! Shared configuration, error kinds and wire types for the Flashboard
//! control-plane backend.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Flashboard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
