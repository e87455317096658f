//! Core data model for NeverDown.
//!
//! This crate defines the primary data structures for:
//! - Incidents, their timelines and lifecycle states
//! - Per-agent artifacts (sanitization, detective, reasoner, verification)
//! - Patches and pull-request records
//! - Append-only audit events

pub mod analysis;
pub mod audit;
pub mod incident;
pub mod patch;
pub mod pull_request;
pub mod verification;

pub use analysis::{
    DetectiveReport, ErrorInfo, FailureCategory, RecentChange, SanitizationEntry,
    SanitizationReport, SuspectedFile, SuspectedFunction,
};
pub use audit::{AuditEvent, AuditEventKind};
pub use incident::{
    logs_are_actionable, Incident, IncidentCreate, IncidentSource, IncidentStatus, RepositoryRef,
    Severity, TimelineEvent,
};
pub use patch::{FileAction, FileChange, Patch, ReasonerOutput, TokenUsage};
pub use pull_request::{PrStatus, PullRequestRecord};
pub use verification::{
    SandboxInfo, TestCaseResult, TestOutcome, VerificationResult, VerificationStatus,
};
