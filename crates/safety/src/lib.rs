//! Safety assessment for Dialoguard — keyword pre-flight, model verdicts,
//! escalation and audit logging.
//!
//! Provides:
//! - **Scanner**: case-insensitive keyword and fuzzy phrase matching
//! - **Verdicts**: a uniform view of pre-flight and model safety signals
//! - **Assessor**: blocking, recipient notification and auditing
//! - **Audit logging**: structured safety event logging

pub mod assessor;
pub mod audit;
pub mod scanner;
pub mod verdict;

pub use assessor::{SafetyAction, SafetyAssessor};
pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditSink, JsonLinesSink, TracingSink};
pub use scanner::{KeywordMatch, KeywordScanner, excerpt};
pub use verdict::{SafetyVerdict, VerdictSource};
