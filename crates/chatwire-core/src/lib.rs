//! Session, routing, relay, and admission logic for Chatwire.
//!
//! This crate holds the in-memory relay core: the session registry, the room
//! router, the message relay, the delivery tracker, and the admission
//! controller, wired together by the [`hub::RelayHub`]. It depends only on
//! `chatwire-types` -- never on the transport layer or any IO crate; the
//! transport hands it mailbox senders and decoded events.

pub mod admission;
pub mod delivery;
pub mod event;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod router;
pub mod transport;
