//! Domain types for the completion facade.
//!
//! These types are independent of process management and transport.

mod chat;
mod health;

pub use chat::{Completion, CompletionOptions, ConversationTurn, ResolvedOptions, TurnRole};
pub use health::{
    HealthSnapshot, HealthState, LifecycleEvent, ProcessHealth, TransitionError,
};
