use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connect::is_local_host;
use crate::error::{Result, SessionError};

/// Debuggee endpoints with a live session. Shared explicitly between the
/// sessions of one adapter process so that a debuggee is never driven by two
/// sessions at once.
#[derive(Debug, Clone, Default)]
pub struct AttachRegistry {
    endpoints: Arc<Mutex<HashSet<String>>>,
}

/// Canonical `host:port` for an endpoint; all local host spellings collapse
/// onto `127.0.0.1`.
///
/// The key is textual. No name resolution happens, so the machine's LAN
/// address or hostname produces a different key from `localhost`, and two
/// sessions can reach the same debuggee through those two spellings.
pub fn endpoint_key(host: &str, port: u16) -> String {
    if is_local_host(host) {
        format!("127.0.0.1:{port}")
    } else {
        format!("{}:{port}", host.trim().to_ascii_lowercase())
    }
}

impl AttachRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `endpoint` for the calling session. The claim is released when the
    /// returned guard is dropped.
    pub fn claim(&self, endpoint: String) -> Result<AttachGuard> {
        let mut endpoints = self.endpoints.lock();
        if !endpoints.insert(endpoint.clone()) {
            return Err(SessionError::AlreadyAttached(endpoint));
        }
        tracing::debug!(target = "pyrite.dap", endpoint = %endpoint, "claimed debuggee endpoint");
        Ok(AttachGuard {
            registry: self.clone(),
            endpoint,
        })
    }

    pub fn is_claimed(&self, endpoint: &str) -> bool {
        self.endpoints.lock().contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }
}

#[derive(Debug)]
pub struct AttachGuard {
    registry: AttachRegistry,
    endpoint: String,
}

impl AttachGuard {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.registry.endpoints.lock().remove(&self.endpoint);
        tracing::debug!(target = "pyrite.dap", endpoint = %self.endpoint, "released debuggee endpoint");
    }
}
