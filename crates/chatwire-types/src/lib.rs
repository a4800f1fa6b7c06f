//! Shared domain types for Chatwire.
//!
//! This crate contains the core domain types used across the Chatwire relay:
//! sessions, rooms, messages, delivery receipts, wire events, configuration,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror,
//! and base64 for the wire encoding of payload bytes.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod room;
pub mod session;
