//! Proactive messaging: when to speak up on our own, and what to say.

mod natural;

pub use natural::{
    Category, MessagePool, NaturalScheduler, SendDecision, SuppressReason, TickOutcome,
    FALLBACK_MESSAGE,
};
