//! Shared primitives for NeverDown.
//!
//! This crate holds the pieces every other crate leans on:
//! - The closed error taxonomy and the stage-boundary failure type
//! - A secret wrapper that cannot be stringified by accident
//! - Recursive redaction of sensitive keys in structured payloads
//! - Repository URL canonicalisation

pub mod error;
pub mod redact;
pub mod repo_url;
pub mod secret;

pub use error::{AgentFailure, ErrorCode};
pub use secret::Secret;
