//! The turn pipeline — the heart of Dialoguard.
//!
//! Every user turn follows the same path:
//!
//! 1. **Admit** the turn (per-user rate limit, blocked-conversation check)
//! 2. **Scan** the raw user text for configured danger keywords
//! 3. **Assemble** the instruction layers, recent history and the user turn
//! 4. **Call upstream**, either blocking inside the validate/retry loop or
//!    streaming through a [`StreamDeliveryBuffer`]
//! 5. **Review** the validated envelope's safety section and progress update
//! 6. **Commit** exactly one assistant message
//!
//! A pre-flight emergency ends the turn at step 2 without any upstream call.

pub mod context;
pub mod pipeline;
pub mod rate_limit;
pub mod stream_buffer;
pub mod stream_event;
pub mod testing;

pub use context::{AssemblyOptions, ContextAssembler, InstructionLayer, InteractionMode, LayerKind};
pub use pipeline::{TurnPipeline, TurnRequest, TurnResponse};
pub use rate_limit::RateLimiter;
pub use stream_buffer::{CommitOutcome, StreamDeliveryBuffer, StreamState};
pub use stream_event::StreamEvent;
