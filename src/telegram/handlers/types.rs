//! Handler types and shared dependencies

use std::sync::Arc;

use dashmap::DashMap;
use teloxide::types::ChatId;

use crate::core::config;
use crate::download::job::JobRegistry;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub registry: Arc<JobRegistry>,
    /// Per-chat upload mode; chats without an entry use the env default
    pub upload_modes: Arc<DashMap<ChatId, bool>>,
}

impl HandlerDeps {
    /// Create new handler dependencies
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            upload_modes: Arc::new(DashMap::new()),
        }
    }

    /// Whether uploads for this chat go out as documents.
    pub fn upload_as_document(&self, chat_id: ChatId) -> bool {
        self.upload_modes
            .get(&chat_id)
            .map(|entry| *entry)
            .unwrap_or(*config::UPLOAD_AS_DOCUMENT)
    }

    pub fn set_upload_mode(&self, chat_id: ChatId, as_document: bool) {
        self.upload_modes.insert(chat_id, as_document);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_mode_toggle() {
        let deps = HandlerDeps::new(Arc::new(JobRegistry::new()));
        let chat = ChatId(42);

        deps.set_upload_mode(chat, true);
        assert!(deps.upload_as_document(chat));

        deps.set_upload_mode(chat, false);
        assert!(!deps.upload_as_document(chat));
    }
}
