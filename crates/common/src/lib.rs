//! Shared settings, error types and IDs for fq crates.
//!
//! Architecture role:
//! - defines per-query [`Settings`] passed across layers
//! - provides common [`FqError`] / [`Result`] contracts
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]

pub mod config;
pub mod error;
pub mod ids;

pub use config::{OverflowMode, Settings, TotalsMode};
pub use error::{FqError, Result};
pub use ids::*;
