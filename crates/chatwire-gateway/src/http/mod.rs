//! HTTP layer: router, handlers, and response plumbing.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
