//! Slot registry: local handlers callers can reach by name, plus the
//! visibility rule that decides who is allowed to call one.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use kb_common::{ErrorCode, Hash, KaraboError, Result};

pub type SlotFuture = Pin<Box<dyn Future<Output = Result<Hash>> + Send>>;
pub type SlotHandler = Arc<dyn Fn(Hash) -> SlotFuture + Send + Sync>;

/// Who may call a registered slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotVisibility {
    /// Only instance ids explicitly added to the slot's allowlist.
    Specific(HashSet<String>),
    /// Any caller running on the same host (compared via the envelope's
    /// `hostName` header).
    HostIdInvariant,
    /// Any caller in the same broker domain — effectively public.
    NetworkIdInvariant,
}

struct RegisteredSlot {
    handler: SlotHandler,
    visibility: SlotVisibility,
}

/// Holds every slot this instance exposes.
#[derive(Default)]
pub struct SlotRegistry {
    slots: DashMap<String, RegisteredSlot>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, visibility: SlotVisibility, handler: SlotHandler) {
        self.slots.insert(name.to_string(), RegisteredSlot { handler, visibility });
    }

    pub fn unregister(&self, name: &str) {
        self.slots.remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Check whether `caller_instance_id` (and, for host-scoped slots,
    /// `caller_host`) may invoke `name`.
    pub fn is_allowed(&self, name: &str, caller_instance_id: &str, caller_host: Option<&str>, own_host: &str) -> bool {
        match self.slots.get(name) {
            None => false,
            Some(slot) => match &slot.visibility {
                SlotVisibility::NetworkIdInvariant => true,
                SlotVisibility::HostIdInvariant => caller_host.map(|h| h == own_host).unwrap_or(false),
                SlotVisibility::Specific(allowed) => allowed.contains(caller_instance_id),
            },
        }
    }

    /// Run the named slot's handler with `body`, returning its reply. The
    /// caller must have already checked [`SlotRegistry::is_allowed`].
    pub async fn invoke(&self, name: &str, body: Hash) -> Result<Hash> {
        let handler = self
            .slots
            .get(name)
            .map(|s| s.handler.clone())
            .ok_or_else(|| KaraboError::new(ErrorCode::LogicError, format!("no such slot '{name}'")))?;
        handler(body).await
    }
}
