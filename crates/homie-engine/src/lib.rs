//! The turn engine and its collaborators: message accumulation, context
//! building, generation with slop gating, behavior decisions, tool
//! execution, LLM backends, and proactive outreach.

pub mod accumulator;
pub mod backend;
pub mod behavior;
pub mod context;
pub mod extract;
pub mod identity;
pub mod json;
pub mod lifecycle;
pub mod proactive;
pub mod sanitize;
pub mod slop;
pub mod tools;
pub mod turn;

pub use turn::{TurnEngine, TurnEngineConfig, TurnStores};
