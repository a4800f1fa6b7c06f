//! Shared state handed to every HTTP and WebSocket handler.

use std::sync::Arc;

use chatwire_core::hub::RelayHub;

#[derive(Debug, Clone)]
pub struct GatewayState {
    pub hub: Arc<RelayHub>,
}
