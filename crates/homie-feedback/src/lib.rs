//! Outcome tracking for sent messages: reactions, replies, and the scoring
//! pass that turns quiet rows into behavior lessons.
//!
//! Reactions and replies can arrive before the outgoing message is
//! registered (transports are not ordered with respect to each other), so
//! every path is idempotent and reconciles forward.

pub mod db;
pub mod error;
pub mod refkey;
pub mod score;
pub mod store;

pub use error::{FeedbackError, Result};
pub use refkey::derive_ref_key;
pub use score::{detect_refinement, score_feedback, FeedbackSignals};
pub use store::{FeedbackStore, OutgoingRow};
