//! Wordmeter Library
//!
//! A metered streaming-inference endpoint: clients open a request, receive a
//! slow drip of tokens, and are charged per emitted word against a durable
//! quota while a per-user fixed-window limiter throttles request volume.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod stream;

pub use config::Config;
pub use coordinator::{SessionCoordinator, SessionReport};
pub use error::{MeteringError, ReconciliationError};
pub use quota::QuotaLedger;
pub use rate_limit::RateLimiter;
pub use stream::{StreamOptions, StreamSession, TerminationReason, TokenSink};
