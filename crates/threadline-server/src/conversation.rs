use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use threadline_config::Config;
use threadline_contracts::{HistoryPage, Message, NewMessage};
use threadline_kernel::{
    is_canonical_lead_id, lead_cache_name, normalize_phone, phone_subscription_key,
    rfc3339_millis, thread_key, window_cache_name, OrderingKey,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::hub::BroadcastHub;
use crate::store::{CallSession, MemoryStore, PendingMessage, SqliteStore, StoreBackend};

pub const MAX_HISTORY_PAGE: usize = 500;

#[derive(Debug, Clone, Error)]
pub enum ConversationError {
    #[error("{0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

fn unavailable(e: String) -> ConversationError {
    ConversationError::StoreUnavailable(e)
}

#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub auto_create_leads: bool,
    pub window_size: usize,
    pub window_ttl: Duration,
    pub lead_ttl: Duration,
}

impl StoreSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            auto_create_leads: cfg.leads.auto_create,
            window_size: cfg.cache.window_size,
            window_ttl: Duration::from_secs(cfg.cache.window_ttl_secs),
            lead_ttl: Duration::from_secs(cfg.cache.lead_ttl_secs),
        }
    }
}

/// One async lock per (organization, phone) thread. Appends hold it from the
/// dedup check until the broadcast so delivery order equals sequence order.
#[derive(Default)]
struct ThreadLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, thread: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > 4_096 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(thread.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Durable conversation history with a write-through cache window and live
/// fan-out of every accepted turn.
pub struct ConversationStore {
    backend: Mutex<StoreBackend>,
    cache: Arc<CacheLayer>,
    hub: Arc<BroadcastHub>,
    locks: ThreadLocks,
    settings: StoreSettings,
}

impl ConversationStore {
    pub fn open(
        cfg: &Config,
        cache: Arc<CacheLayer>,
        hub: Arc<BroadcastHub>,
    ) -> Result<Self, String> {
        let backend = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            backend: Mutex::new(backend),
            cache,
            hub,
            locks: ThreadLocks::default(),
            settings: StoreSettings::from_config(cfg),
        })
    }

    /// Numbers messages stored before sequencing existed. Idempotent.
    pub async fn backfill_sequences(&self) -> Result<usize, ConversationError> {
        let numbered = self
            .backend
            .lock()
            .await
            .backfill_sequences()
            .map_err(unavailable)?;
        if numbered > 0 {
            info!(numbered, "assigned sequence numbers to legacy messages");
        }
        Ok(numbered)
    }

    pub async fn append_message(&self, input: NewMessage) -> Result<Appended, ConversationError> {
        let organization_id = required_org(&input.organization_id)?;
        let phone = normalize(&input.phone_number)?;
        if input.content.trim().is_empty() {
            return Err(ConversationError::Validation(
                "content must not be empty".to_string(),
            ));
        }
        let now_ms = Utc::now().timestamp_millis();
        let timestamp_ms = match input.timestamp.as_deref() {
            Some(ts) => rfc3339_millis(ts).ok_or_else(|| {
                ConversationError::Validation("timestamp must be RFC3339".to_string())
            })?,
            None => now_ms,
        };
        let external_ref = input.external_ref.filter(|v| !v.trim().is_empty());

        let _thread = self.locks.acquire(&thread_key(&organization_id, &phone)).await;

        if let Some(external_ref) = external_ref.as_deref() {
            let existing = self
                .backend
                .lock()
                .await
                .find_by_external_ref(&organization_id, &phone, external_ref)
                .map_err(unavailable)?;
            if let Some(message) = existing {
                debug!(
                    organization_id = %organization_id,
                    external_ref,
                    sequence = message.sequence_number,
                    "duplicate delivery ignored"
                );
                return Ok(Appended {
                    message,
                    duplicate: true,
                });
            }
        }

        let lead_id = self
            .attach_lead(&organization_id, &phone, input.lead_id.as_deref())
            .await?;

        let pending = PendingMessage {
            id: format!("msg_{}", uuid::Uuid::new_v4().as_simple()),
            organization_id: organization_id.clone(),
            lead_id,
            phone: phone.clone(),
            channel: input.channel,
            direction: input.direction,
            sent_by: input.sent_by,
            content: input.content,
            timestamp_ms,
            created_at_ms: now_ms,
            external_ref,
        };

        let (message, window, targets) = {
            let mut backend = self.backend.lock().await;
            let message = backend.insert_sequenced(pending).map_err(unavailable)?;
            let window = backend
                .latest(&organization_id, &phone, self.settings.window_size)
                .ok();
            let mut targets = Vec::new();
            if let Some(lead_id) = message.lead_id.as_deref() {
                targets.push(lead_id.to_string());
                match backend.aliases_of(&organization_id, lead_id) {
                    Ok(aliases) => targets.extend(aliases),
                    Err(e) => warn!(error = %e, "alias lookup failed; broadcasting to lead only"),
                }
            }
            targets.push(phone_subscription_key(&phone));
            (message, window, targets)
        };

        match window {
            Some(window) => self.store_window(&organization_id, &phone, &window).await,
            None => {
                self.cache
                    .del(&organization_id, &window_cache_name(&phone))
                    .await
            }
        }

        let delivered = self.hub.publish(&targets, &message);
        debug!(
            organization_id = %organization_id,
            sequence = message.sequence_number,
            channel = message.channel.as_str(),
            delivered,
            "message appended"
        );
        Ok(Appended {
            message,
            duplicate: false,
        })
    }

    /// Applies an incoming lead id to the phone thread. Canonical ids link the
    /// thread (first link wins); demo ids become aliases of the thread's lead.
    pub async fn attach_lead(
        &self,
        organization_id: &str,
        phone: &str,
        lead_id: Option<&str>,
    ) -> Result<Option<String>, ConversationError> {
        let lead_id = lead_id.map(str::trim).filter(|v| !v.is_empty());
        match lead_id {
            Some(id) if is_canonical_lead_id(id) => {
                let owner = self
                    .backend
                    .lock()
                    .await
                    .link_lead(organization_id, phone, id)
                    .map_err(unavailable)?;
                if owner != id {
                    warn!(
                        organization_id,
                        requested = id,
                        owner = %owner,
                        "phone already linked to another lead"
                    );
                }
                self.cache
                    .set(
                        organization_id,
                        &lead_cache_name(phone),
                        &owner,
                        self.settings.lead_ttl,
                    )
                    .await;
                Ok(Some(owner))
            }
            Some(alias) => {
                let lead = self.resolve_lead_for_phone(organization_id, phone).await?;
                if let Some(lead) = lead.as_deref() {
                    self.bind_alias(organization_id, alias, lead).await?;
                }
                Ok(lead)
            }
            None => self.resolve_lead_for_phone(organization_id, phone).await,
        }
    }

    async fn bind_alias(
        &self,
        organization_id: &str,
        alias: &str,
        lead_id: &str,
    ) -> Result<String, ConversationError> {
        let owner = self
            .backend
            .lock()
            .await
            .bind_alias(organization_id, alias, lead_id)
            .map_err(unavailable)?;
        if owner != lead_id {
            warn!(organization_id, alias, owner = %owner, "alias already bound to another lead");
        }
        Ok(owner)
    }

    /// Canonical lead for a phone thread, creating one when configured to.
    pub async fn resolve_lead_for_phone(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<String>, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        let cache_name = lead_cache_name(&phone);
        if let Some(lead) = self.cache.get(&organization_id, &cache_name).await {
            return Ok(Some(lead));
        }

        let linked = self
            .backend
            .lock()
            .await
            .lead_for_phone(&organization_id, &phone)
            .map_err(unavailable)?;
        let lead = match linked {
            Some(lead) => lead,
            None if self.settings.auto_create_leads => {
                let created = uuid::Uuid::new_v4().to_string();
                let owner = self
                    .backend
                    .lock()
                    .await
                    .link_lead(&organization_id, &phone, &created)
                    .map_err(unavailable)?;
                if owner == created {
                    info!(organization_id = %organization_id, lead_id = %owner, "created lead for phone");
                }
                owner
            }
            None => return Ok(None),
        };
        self.cache
            .set(&organization_id, &cache_name, &lead, self.settings.lead_ttl)
            .await;
        Ok(Some(lead))
    }

    /// Maps a subscription lead key to the key messages are published under.
    pub async fn resolve_lead_key(
        &self,
        organization_id: &str,
        lead_key: &str,
        phone: Option<&str>,
    ) -> Result<String, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let lead_key = lead_key.trim();
        if lead_key.is_empty() {
            return Err(ConversationError::Validation(
                "lead key must not be empty".to_string(),
            ));
        }
        if is_canonical_lead_id(lead_key) || lead_key.starts_with("phone:") {
            return Ok(lead_key.to_string());
        }
        let bound = self
            .backend
            .lock()
            .await
            .alias_target(&organization_id, lead_key)
            .map_err(unavailable)?;
        if let Some(lead) = bound {
            return Ok(lead);
        }
        let Some(phone) = phone else {
            return Ok(lead_key.to_string());
        };
        let phone = normalize(phone)?;
        match self.resolve_lead_for_phone(&organization_id, &phone).await? {
            Some(lead) => self.bind_alias(&organization_id, lead_key, &lead).await,
            None => Ok(phone_subscription_key(&phone)),
        }
    }

    /// Phone thread behind a lead key, if one is known.
    pub async fn phone_for_lead_key(
        &self,
        organization_id: &str,
        lead_key: &str,
    ) -> Result<Option<String>, ConversationError> {
        if let Some(phone) = lead_key.strip_prefix("phone:") {
            return Ok(Some(phone.to_string()));
        }
        let backend = self.backend.lock().await;
        let lead = match backend
            .alias_target(organization_id, lead_key)
            .map_err(unavailable)?
        {
            Some(lead) => lead,
            None => lead_key.to_string(),
        };
        backend
            .phone_for_lead(organization_id, &lead)
            .map_err(unavailable)
    }

    pub async fn get_history(
        &self,
        organization_id: &str,
        phone: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        if limit == 0 || limit > MAX_HISTORY_PAGE {
            return Err(ConversationError::Validation(format!(
                "limit must be between 1 and {MAX_HISTORY_PAGE}"
            )));
        }
        let after = match cursor.filter(|c| !c.is_empty()) {
            Some(c) => Some(
                OrderingKey::decode(c)
                    .map_err(|e| ConversationError::Validation(e.to_string()))?,
            ),
            None => None,
        };
        let mut messages = self
            .backend
            .lock()
            .await
            .history(&organization_id, &phone, after.as_ref(), limit + 1)
            .map_err(unavailable)?;
        let next_cursor = if messages.len() > limit {
            messages.truncate(limit);
            messages
                .last()
                .and_then(OrderingKey::of)
                .map(|k| k.encode())
        } else {
            None
        };
        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    /// The newest `max_turns` messages in ascending order, served from the
    /// cached window when it covers the request.
    pub async fn recent_messages(
        &self,
        organization_id: &str,
        phone: &str,
        max_turns: usize,
    ) -> Result<Vec<Message>, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        let window_size = self.settings.window_size;
        let window_name = window_cache_name(&phone);

        if max_turns <= window_size {
            if let Some(raw) = self.cache.get(&organization_id, &window_name).await {
                match serde_json::from_str::<Vec<Message>>(&raw) {
                    Ok(window) => return Ok(tail(window, max_turns)),
                    Err(e) => debug!(error = %e, "discarding unreadable cached window"),
                }
            }
        }

        // Populate under the thread lock so a concurrent append cannot be
        // overwritten by an older read.
        let _thread = self.locks.acquire(&thread_key(&organization_id, &phone)).await;
        let messages = self
            .backend
            .lock()
            .await
            .latest(&organization_id, &phone, window_size.max(max_turns))
            .map_err(unavailable)?;
        let window_start = messages.len().saturating_sub(window_size);
        self.store_window(&organization_id, &phone, &messages[window_start..])
            .await;
        Ok(tail(messages, max_turns))
    }

    async fn store_window(&self, organization_id: &str, phone: &str, window: &[Message]) {
        match serde_json::to_string(window) {
            Ok(raw) => {
                self.cache
                    .set(
                        organization_id,
                        &window_cache_name(phone),
                        &raw,
                        self.settings.window_ttl,
                    )
                    .await
            }
            Err(e) => warn!(error = %e, "window serialization failed"),
        }
    }

    pub async fn latest_sequence(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<i64>, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        self.backend
            .lock()
            .await
            .latest_sequence(&organization_id, &phone)
            .map_err(unavailable)
    }

    pub async fn register_call(
        &self,
        conversation_id: &str,
        organization_id: &str,
        phone: &str,
        lead_id: Option<&str>,
    ) -> Result<Option<String>, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        if conversation_id.trim().is_empty() {
            return Err(ConversationError::Validation(
                "conversationId is required".to_string(),
            ));
        }
        let lead = self.attach_lead(&organization_id, &phone, lead_id).await?;
        let call = CallSession {
            conversation_id: conversation_id.trim().to_string(),
            organization_id,
            phone,
            lead_id: lead.clone(),
            started_at_ms: Utc::now().timestamp_millis(),
        };
        self.backend
            .lock()
            .await
            .save_call(&call)
            .map_err(unavailable)?;
        Ok(lead)
    }

    pub(crate) async fn find_call(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CallSession>, ConversationError> {
        self.backend
            .lock()
            .await
            .find_call(conversation_id.trim())
            .map_err(unavailable)
    }

    pub async fn purge_thread(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<u64, ConversationError> {
        let organization_id = required_org(organization_id)?;
        let phone = normalize(phone)?;
        let _thread = self.locks.acquire(&thread_key(&organization_id, &phone)).await;
        let deleted = self
            .backend
            .lock()
            .await
            .purge_thread(&organization_id, &phone)
            .map_err(unavailable)?;
        self.cache
            .del(&organization_id, &window_cache_name(&phone))
            .await;
        info!(organization_id = %organization_id, deleted, "conversation thread purged");
        Ok(deleted)
    }
}

fn required_org(organization_id: &str) -> Result<String, ConversationError> {
    let organization_id = organization_id.trim();
    if organization_id.is_empty() {
        return Err(ConversationError::Validation(
            "organizationId is required".to_string(),
        ));
    }
    Ok(organization_id.to_string())
}

fn normalize(phone: &str) -> Result<String, ConversationError> {
    normalize_phone(phone).map_err(|e| ConversationError::Validation(format!("phone number: {e}")))
}

fn tail(mut messages: Vec<Message>, n: usize) -> Vec<Message> {
    let start = messages.len().saturating_sub(n);
    messages.split_off(start)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::tests::FlakyCache;
    use std::sync::atomic::Ordering;
    use threadline_config::{Cache, Server, Store};
    use threadline_contracts::{Channel, Direction, SentBy};

    pub(crate) fn test_config() -> Config {
        Config {
            server: Server {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            environment: "test".to_string(),
            store: Store {
                kind: "memory".to_string(),
                sqlite_path: None,
            },
            cache: Cache {
                backend: "none".to_string(),
                redis_url: None,
                op_timeout_ms: 50,
                reconnect_interval_ms: 50,
                sweep_interval_ms: 1_000,
                window_ttl_secs: 60,
                window_size: 3,
                lead_ttl_secs: 60,
            },
            stream: Default::default(),
            ingest: Default::default(),
            context: Default::default(),
            leads: Default::default(),
            routing: Default::default(),
            logging: Default::default(),
        }
    }

    pub(crate) fn open_store(cfg: &Config, cache: Arc<CacheLayer>) -> (ConversationStore, Arc<BroadcastHub>) {
        let hub = Arc::new(BroadcastHub::new(16));
        let store = ConversationStore::open(cfg, cache, hub.clone()).unwrap();
        (store, hub)
    }

    fn local_cache() -> Arc<CacheLayer> {
        Arc::new(CacheLayer::new("test", None, Duration::from_millis(50)))
    }

    pub(crate) fn turn(org: &str, phone: &str, content: &str, ts: &str) -> NewMessage {
        NewMessage {
            organization_id: org.to_string(),
            phone_number: phone.to_string(),
            lead_id: None,
            channel: Channel::Sms,
            direction: Direction::Inbound,
            sent_by: SentBy::Lead,
            content: content.to_string(),
            timestamp: Some(ts.to_string()),
            external_ref: None,
        }
    }

    #[tokio::test]
    async fn same_timestamp_appends_keep_arrival_order() {
        let (store, _) = open_store(&test_config(), local_cache());
        let ts = "2026-03-01T10:00:00.000Z";
        let first = store
            .append_message(turn("org-a", "(555) 010-0001", "Hi", ts))
            .await
            .unwrap();
        let mut voice = turn("org-a", "+15550100001", "Hello", ts);
        voice.channel = Channel::Voice;
        voice.sent_by = SentBy::Agent;
        voice.direction = Direction::Outbound;
        let second = store.append_message(voice).await.unwrap();
        assert_eq!(first.message.sequence_number, 1);
        assert_eq!(second.message.sequence_number, 2);

        let page = store
            .get_history("org-a", "555-010-0001", 50, None)
            .await
            .unwrap();
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi", "Hello"]);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn external_ref_redelivery_is_idempotent() {
        let (store, hub) = open_store(&test_config(), local_cache());
        let mut registration = hub.register("org-a", "phone:+15550100001");
        let mut input = turn("org-a", "+15550100001", "Hi", "2026-03-01T10:00:00Z");
        input.external_ref = Some("SM123".to_string());
        let lead_off = {
            let mut cfg = test_config();
            cfg.leads.auto_create = false;
            cfg
        };
        let (store_no_leads, hub_no_leads) = open_store(&lead_off, local_cache());
        let mut phone_sub = hub_no_leads.register("org-a", "phone:+15550100001");

        let first = store.append_message(input.clone()).await.unwrap();
        let again = store.append_message(input.clone()).await.unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(again.message.id, first.message.id);
        assert_eq!(registration.receiver.try_recv().unwrap().id, first.message.id);
        assert!(registration.receiver.try_recv().is_err());

        store_no_leads.append_message(input.clone()).await.unwrap();
        store_no_leads.append_message(input).await.unwrap();
        assert!(phone_sub.receiver.try_recv().is_ok());
        assert!(phone_sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn appends_require_org_content_and_phone() {
        let (store, _) = open_store(&test_config(), local_cache());
        let ts = "2026-03-01T10:00:00Z";
        for bad in [
            turn("", "+15550100001", "Hi", ts),
            turn("org-a", "+15550100001", "   ", ts),
            turn("org-a", "not-a-phone", "Hi", ts),
            turn("org-a", "+15550100001", "Hi", "yesterday"),
        ] {
            assert!(matches!(
                store.append_message(bad).await,
                Err(ConversationError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn history_is_tenant_isolated_and_paginates() {
        let (store, _) = open_store(&test_config(), local_cache());
        for i in 0..5 {
            store
                .append_message(turn(
                    "org-a",
                    "+15550100001",
                    &format!("a{i}"),
                    &format!("2026-03-01T10:00:0{i}Z"),
                ))
                .await
                .unwrap();
        }
        store
            .append_message(turn("org-b", "+15550100001", "b0", "2026-03-01T10:00:00Z"))
            .await
            .unwrap();

        let first = store
            .get_history("org-a", "+15550100001", 2, None)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();
        let second = store
            .get_history("org-a", "+15550100001", 10, Some(&cursor))
            .await
            .unwrap();
        let contents: Vec<&str> = second.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a2", "a3", "a4"]);
        assert!(second.next_cursor.is_none());

        let other = store
            .get_history("org-b", "+15550100001", 10, None)
            .await
            .unwrap();
        assert_eq!(other.messages.len(), 1);
        assert_eq!(other.messages[0].sequence_number, 1);

        assert!(matches!(
            store
                .get_history("org-a", "+15550100001", 10, Some("garbage"))
                .await,
            Err(ConversationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn demo_alias_binds_to_the_phone_lead() {
        let (store, hub) = open_store(&test_config(), local_cache());
        let key = store
            .resolve_lead_key("org-a", "demo-42", Some("+15550100001"))
            .await
            .unwrap();
        assert!(is_canonical_lead_id(&key));
        let mut sub = hub.register("org-a", &key);

        let appended = store
            .append_message(turn("org-a", "+15550100001", "Hi", "2026-03-01T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(appended.message.lead_id.as_deref(), Some(key.as_str()));
        assert_eq!(sub.receiver.try_recv().unwrap().content, "Hi");

        assert_eq!(
            store.resolve_lead_key("org-a", "demo-42", None).await.unwrap(),
            key
        );
        assert_eq!(
            store
                .resolve_lead_key("org-b", "demo-42", None)
                .await
                .unwrap(),
            "demo-42"
        );
    }

    #[tokio::test]
    async fn message_with_demo_lead_reaches_alias_subscribers() {
        let (store, hub) = open_store(&test_config(), local_cache());
        let mut alias_sub = hub.register("org-a", "demo-7");
        let mut input = turn("org-a", "+15550100001", "Hello", "2026-03-01T10:00:00Z");
        input.lead_id = Some("demo-7".to_string());
        let appended = store.append_message(input).await.unwrap();
        assert!(appended.message.lead_id.is_some());
        assert_eq!(alias_sub.receiver.try_recv().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn canonical_lead_link_is_first_write_wins() {
        let mut cfg = test_config();
        cfg.leads.auto_create = false;
        let (store, _) = open_store(&cfg, local_cache());
        assert_eq!(
            store
                .resolve_lead_for_phone("org-a", "+15550100001")
                .await
                .unwrap(),
            None
        );
        let first = uuid::Uuid::new_v4().to_string();
        let second = uuid::Uuid::new_v4().to_string();
        let mut input = turn("org-a", "+15550100001", "Hi", "2026-03-01T10:00:00Z");
        input.lead_id = Some(first.clone());
        store.append_message(input.clone()).await.unwrap();
        input.lead_id = Some(second);
        let appended = store.append_message(input).await.unwrap();
        assert_eq!(appended.message.lead_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn recent_messages_follow_the_write_through_window() {
        let external = FlakyCache::online();
        let cache = Arc::new(CacheLayer::new(
            "test",
            Some(external.clone()),
            Duration::from_millis(50),
        ));
        let (store, _) = open_store(&test_config(), cache.clone());
        for i in 0..5 {
            store
                .append_message(turn(
                    "org-a",
                    "+15550100001",
                    &format!("m{i}"),
                    &format!("2026-03-01T10:00:0{i}Z"),
                ))
                .await
                .unwrap();
        }
        let window_key = cache.key("org-a", &window_cache_name("+15550100001"));
        let cached: Vec<Message> =
            serde_json::from_str(external.entries.lock().get(&window_key).unwrap()).unwrap();
        assert_eq!(cached.len(), 3);
        assert_eq!(cached[2].content, "m4");

        let recent = store
            .recent_messages("org-a", "+15550100001", 2)
            .await
            .unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        let wide = store
            .recent_messages("org-a", "+15550100001", 10)
            .await
            .unwrap();
        assert_eq!(wide.len(), 5);

        external.online.store(false, Ordering::SeqCst);
        let during_outage = store
            .recent_messages("org-a", "+15550100001", 2)
            .await
            .unwrap();
        assert_eq!(during_outage.len(), 2);
    }

    #[tokio::test]
    async fn purge_clears_history_and_window() {
        let (store, _) = open_store(&test_config(), local_cache());
        store
            .append_message(turn("org-a", "+15550100001", "Hi", "2026-03-01T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(store.purge_thread("org-a", "+15550100001").await.unwrap(), 1);
        assert!(store
            .recent_messages("org-a", "+15550100001", 5)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.latest_sequence("org-a", "+15550100001").await.unwrap(),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_sequenced_and_broadcast_in_order() {
        let (store, hub) = open_store(&test_config(), local_cache());
        let store = Arc::new(store);
        let mut first = hub.register("org-a", &phone_subscription_key("+15550100001"));
        let mut second = hub.register("org-a", &phone_subscription_key("+15550100001"));

        let writers = 12;
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .append_message(turn(
                            "org-a",
                            "+15550100001",
                            &format!("m{i}"),
                            "2026-03-01T10:00:00Z",
                        ))
                        .await
                        .unwrap()
                        .message
                        .sequence_number
                })
            })
            .collect();
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=writers).collect::<Vec<i64>>());

        for registration in [&mut first, &mut second] {
            let mut received = Vec::new();
            while let Ok(message) = registration.receiver.try_recv() {
                received.push(message.sequence_number);
            }
            assert_eq!(received, (1..=writers).collect::<Vec<i64>>());
        }

        let page = store
            .get_history("org-a", "+15550100001", 50, None)
            .await
            .unwrap();
        let stored: Vec<i64> = page.messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(stored, (1..=writers).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn append_fails_closed_when_the_store_is_unavailable() {
        let path = std::env::temp_dir()
            .join(format!(
                "threadline-conversation-{}.db",
                uuid::Uuid::new_v4().as_simple()
            ))
            .to_string_lossy()
            .to_string();
        let mut cfg = test_config();
        cfg.store.kind = "sqlite".to_string();
        cfg.store.sqlite_path = Some(path.clone());
        let (store, hub) = open_store(&cfg, local_cache());
        let mut subscriber = hub.register("org-a", &phone_subscription_key("+15550100001"));
        store
            .append_message(turn("org-a", "+15550100001", "Hi", "2026-03-01T10:00:00Z"))
            .await
            .unwrap();
        assert!(subscriber.receiver.try_recv().is_ok());

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("DROP TABLE thread_counters;").unwrap();
        drop(conn);

        let err = store
            .append_message(turn("org-a", "+15550100001", "Again", "2026-03-01T10:00:01Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::StoreUnavailable(_)));
        assert!(subscriber.receiver.try_recv().is_err());
    }
}
