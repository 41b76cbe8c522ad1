//! Long-term memory: people, extracted facts, episodes, and lessons, with
//! hybrid FTS + vector retrieval for context building.

pub mod db;
pub mod error;
pub mod retrieval;
pub mod store;
pub mod types;

pub use error::{MemoryError, Result};
pub use store::MemoryStore;
