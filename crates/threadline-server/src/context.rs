use threadline_kernel::render_context;
use tracing::warn;

use crate::conversation::{ConversationError, ConversationStore};

/// Bounded plain-text digest of the most recent turns of a thread, one
/// `{speaker}: {content}` line per turn. Never fails: a thread that cannot be
/// read yields an empty context so the caller can proceed without it.
pub async fn build_context(
    conversations: &ConversationStore,
    organization_id: &str,
    phone: &str,
    max_turns: usize,
    max_chars: usize,
) -> String {
    if max_turns == 0 || max_chars == 0 {
        return String::new();
    }
    match conversations
        .recent_messages(organization_id, phone, max_turns)
        .await
    {
        Ok(messages) => render_context(&messages, max_chars),
        Err(ConversationError::Validation(e)) => {
            warn!(organization_id, error = %e, "context requested for invalid thread");
            String::new()
        }
        Err(e) => {
            warn!(organization_id, error = %e, "context unavailable; continuing without it");
            String::new()
        }
    }
}

/// Context for a lead key (canonical id, demo alias or `phone:` key).
pub async fn build_context_for_lead(
    conversations: &ConversationStore,
    organization_id: &str,
    lead_key: &str,
    max_turns: usize,
    max_chars: usize,
) -> (Option<String>, String) {
    match conversations
        .phone_for_lead_key(organization_id, lead_key)
        .await
    {
        Ok(Some(phone)) => {
            let context =
                build_context(conversations, organization_id, &phone, max_turns, max_chars).await;
            (Some(phone), context)
        }
        Ok(None) => (None, String::new()),
        Err(e) => {
            warn!(organization_id, lead_key, error = %e, "lead lookup failed; empty context");
            (None, String::new())
        }
    }
}
