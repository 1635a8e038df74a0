//! Rate Limiting Module
//!
//! Per-user request-rate admission control for the generation endpoint.
//!
//! # Features
//!
//! - Fixed-window counting (default 100 requests per 60 s)
//! - Per-user fine-grained locking on a sharded concurrent map
//! - Lazy expiry plus a background sweep tied to the limiter's lifetime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Rate Limiter                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐         │
//! │  │ user-a      │  │ user-b      │  │ user-c      │  ...    │
//! │  │ RateCounter │  │ RateCounter │  │ RateCounter │         │
//! │  └─────────────┘  └─────────────┘  └─────────────┘         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        Sweep task (cancelled on shutdown/drop)       │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod counter;
pub mod limiter;

pub use config::RateLimitConfig;
pub use counter::RateCounter;
pub use limiter::RateLimiter;
