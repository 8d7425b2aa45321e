//! cf-core: shared model, IDs, errors, configuration, and progress events.
//!
//! This crate is the foundational dependency for all other cf-* crates. It
//! defines the work-item state machine types and the checkpoint unit
//! ([`BatchState`]) but holds no mutable runtime state of its own.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod item;
pub mod stage;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use item::*;
pub use stage::Stage;
