//! Request coordination
//!
//! Composes the rate limiter, the quota ledger and the stream loop into
//! "handle one generation request", and reconciles each finished stream back
//! into the ledger on a tracked background task.

pub mod flow;
pub mod reconcile;
pub mod timeout;

pub use flow::{AdmittedSession, SessionCoordinator, SessionReport};
pub use reconcile::{ReconciliationHandle, ReconciliationResult, Reconciler};
pub use timeout::StageTimeout;
