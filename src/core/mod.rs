//! Core utilities and common types for Agora.

pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::GovernanceMessage;
pub use types::*;
