//! Balanced Common Types
//!
//! This crate contains shared types used across the Balanced ledger,
//! including identifiers, the minor-unit amount type, and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
