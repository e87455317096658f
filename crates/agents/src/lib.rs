//! The five NeverDown pipeline stages.
//!
//! Data flows strictly forward: each stage consumes the previous stage's
//! artifact and produces its own. Stage boundaries are sum-typed: every
//! agent returns `Result<Output, AgentFailure>` and never panics across
//! the boundary.
//!
//! - [`sanitizer`] strips secrets from a working copy before any external
//!   model sees code
//! - [`detective`] runs deterministic log/diff analysis, no LLM involved
//! - [`reasoner`] is the only component permitted to call an LLM endpoint
//! - [`verifier`] applies the diff in an isolated sandbox and runs tests
//! - [`publisher`] applies the diff to the original tree and opens a PR

pub mod detective;
pub mod publisher;
pub mod reasoner;
pub mod sanitizer;
mod util;
pub mod verifier;
