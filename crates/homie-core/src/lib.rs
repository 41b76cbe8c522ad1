//! Shared foundation for the Openhomie runtime: identifiers, message and
//! action types, the error taxonomy, configuration, and the concurrency
//! primitives every other crate builds on.

pub mod budget;
pub mod config;
pub mod error;
pub mod external;
pub mod interval;
pub mod keyed;
pub mod limiter;
pub mod sleep;
pub mod types;

pub use error::{HomieError, Result};
