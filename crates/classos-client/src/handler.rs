//! Per-type handlers for inbound messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use classos_core::{Envelope, MessageType};
use parking_lot::RwLock;

use crate::client::AgentClient;
use crate::error::Result;

/// Handles one inbound message type.
///
/// `client` is the connection the message arrived on; handlers reply
/// through it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded envelope.
    async fn handle(&self, client: &AgentClient, envelope: Envelope) -> Result<()>;
}

/// Message type to handler table.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl HandlerTable {
    /// Install `handler` for `kind`, replacing any previous one.
    pub(crate) fn insert(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        let _ = self.handlers.write().insert(kind, handler);
    }

    pub(crate) fn get(&self, kind: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&kind).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().len()
    }
}
