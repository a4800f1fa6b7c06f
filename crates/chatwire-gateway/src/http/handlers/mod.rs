//! Request handlers for the gateway's endpoints.

pub mod admin;
pub mod ws;
