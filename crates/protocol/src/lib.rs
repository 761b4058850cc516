//! # Dialoguard Protocol
//!
//! The structured response contract between the pipeline and the upstream
//! model: envelope types, the schema (as JSON Schema and as instruction
//! text), structural validation and the bounded corrective retry loop.

#![recursion_limit = "256"]

pub mod envelope;
pub mod retry;
pub mod schema;
pub mod validate;

pub use envelope::{
    Content, DangerLevel, EnvelopeMetadata, FieldKind, FieldOption, Form, FormField, MediaItem, ProgressUpdate,
    ResponseEnvelope, SafetySection, TextBlock,
};
pub use retry::{ResponseProtocol, RetryOutcome, Validated};
pub use schema::{json_schema, schema_instruction};
pub use validate::{ValidationOutcome, strip_code_fence, validate};
