//! Query model and stage planning for the fq interpreter.
//!
//! Architecture role:
//! - already-parsed SELECT model ([`query`], [`expr`])
//! - processing stages and the first/second stage split ([`stage`])
//! - name-based action descriptors with backward liveness trimming ([`actions`])
//! - clause analysis into the immutable per-query plan ([`analyzer`], [`analysis`])
//!
//! Key modules:
//! - [`actions`]
//! - [`analysis`]
//! - [`analyzer`]
//! - [`explain`]
//! - [`expr`]
//! - [`query`]
//! - [`stage`]

pub mod actions;
pub mod analysis;
pub mod analyzer;
pub mod explain;
pub mod expr;
pub mod query;
pub mod stage;

pub use actions::*;
pub use analysis::*;
pub use analyzer::*;
pub use explain::*;
pub use expr::*;
pub use query::*;
pub use stage::*;
