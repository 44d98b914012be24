//! In-process transport to a local reactor's sync service.

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use reactor_server::SyncService;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Calls [`SyncService::handle_bytes`] directly, with the same encoding an
/// HTTP exchange would use.
#[derive(Clone)]
pub struct LoopbackTransport {
    service: Arc<SyncService>,
    name: String,
    online: Arc<AtomicBool>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("name", &self.name)
            .field("online", &self.online.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LoopbackTransport {
    /// Transport to `service`, named `name` in logs.
    pub fn new(service: Arc<SyncService>, name: impl Into<String>) -> Self {
        Self {
            service,
            name: format!("loopback:{}", name.into()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing or regaining the connection. Shared by clones.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn request(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if !self.online.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        Ok(self.service.handle_bytes(&body).await)
    }

    fn endpoint(&self) -> &str {
        &self.name
    }
}
