//! Token streaming
//!
//! Seeded token draws from a fixed vocabulary and the paced, cancellable
//! session loop that writes them to a client.

pub mod session;
pub mod vocabulary;

pub use session::{
    Pacing, SessionOutcome, SinkClosed, StreamOptions, StreamSession, TerminationReason,
    TokenSink,
};
