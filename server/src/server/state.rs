//! Server state

use std::sync::Arc;

use crate::host::Host;

/// Server state shared across handlers
pub struct ServerState {
    pub host: Arc<Host>,
}

impl ServerState {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }
}
