//! HTTP surface
//!
//! Thin axum layer over [`SessionCoordinator`](crate::coordinator::SessionCoordinator):
//! headers become stream options, pre-check failures become JSON errors, and
//! admitted sessions stream into a chunked response body.

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::{ApiErrorResponse, ErrorBody};
pub use server::{router, serve, AppState};
