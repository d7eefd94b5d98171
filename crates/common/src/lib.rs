//! Common types for the Gemini relay

mod error;
mod kind;
mod secret;

pub use error::{Error, Result};
pub use kind::ErrorKind;
pub use secret::Secret;
