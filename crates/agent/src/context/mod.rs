//! Instruction assembly for upstream calls.
//!
//! `assembler` composes the ordered instruction layers and renders them,
//! together with recent history and the user turn, into prompt messages.
//! `token` provides the size heuristic used to bound the history window.

pub mod assembler;
pub mod token;

pub use assembler::{
    AssemblyOptions, ContextAssembler, InstructionLayer, InteractionMode, LayerKind, assemble, render_user_turn,
};
