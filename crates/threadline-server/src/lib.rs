use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use threadline_config::Config;
use threadline_contracts::{
    AppendResponse, CallInitiation, CallInitiationResponse, ContextResponse, ErrorBody,
    ErrorResponse, HealthView, HistoryPage, NewMessage, OutboundMessageRequest,
    PurgeResponse, SentBy, SmsWebhook, VoiceTranscriptWebhook, API_VERSION, CONTEXT_VARIABLE,
};
use threadline_kernel::{normalize_phone, sms_event, voice_event};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod cache;
pub mod context;
pub mod conversation;
pub mod hub;
mod store;

pub use cache::{CacheError, CacheHealth, CacheLayer, ExternalCache, RedisCache};
pub use conversation::{ConversationError, ConversationStore};
pub use hub::BroadcastHub;

const DEFAULT_HISTORY_LIMIT: usize = 50;

pub async fn serve(cfg: Config, shutdown: CancellationToken) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let external = external_cache(&cfg)?;
    let app = build_app_with(cfg, external, shutdown.clone()).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

/// Opens the store and runs the legacy sequence backfill without serving.
pub async fn backfill(cfg: Config) -> Result<usize, String> {
    let cache = Arc::new(CacheLayer::new(
        &cfg.environment,
        None,
        Duration::from_millis(cfg.cache.op_timeout_ms),
    ));
    let hub = Arc::new(BroadcastHub::new(cfg.stream.channel_capacity));
    let conversations = ConversationStore::open(&cfg, cache, hub)?;
    conversations
        .backfill_sequences()
        .await
        .map_err(|e| e.to_string())
}

pub fn external_cache(cfg: &Config) -> Result<Option<Arc<dyn ExternalCache>>, String> {
    match (cfg.cache.backend.as_str(), cfg.cache.redis_url.as_deref()) {
        ("redis", Some(url)) => {
            let cache = RedisCache::connect(url).map_err(|e| e.to_string())?;
            Ok(Some(Arc::new(cache)))
        }
        ("redis", None) => Err("cache.redis_url is required for redis cache".to_string()),
        _ => Ok(None),
    }
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let external = external_cache(&cfg)?;
    build_app_with(cfg, external, CancellationToken::new()).await
}

pub async fn build_app_with(
    cfg: Config,
    external: Option<Arc<dyn ExternalCache>>,
    shutdown: CancellationToken,
) -> Result<Router, String> {
    let state = AppState::new(cfg, external, shutdown).await?;
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/sms", post(sms_webhook))
        .route("/webhooks/voice-transcript", post(voice_transcript_webhook))
        .route("/stream/conversation/{lead_key}", get(stream_conversation))
        .route(
            "/conversations/{organization_id}/{phone}/history",
            get(history),
        )
        .route(
            "/conversations/{organization_id}/{phone}/messages",
            post(record_message),
        )
        .route(
            "/conversations/{organization_id}/{phone}/context",
            get(thread_context),
        )
        .route(
            "/leads/{organization_id}/{lead_key}/context",
            get(lead_context),
        )
        .route("/calls", post(initiate_call))
        .route(
            "/admin/conversations/{organization_id}/{phone}",
            delete(purge_thread),
        )
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    conversations: Arc<ConversationStore>,
    cache: Arc<CacheLayer>,
    hub: Arc<BroadcastHub>,
    shutdown: CancellationToken,
}

impl AppState {
    async fn new(
        cfg: Config,
        external: Option<Arc<dyn ExternalCache>>,
        shutdown: CancellationToken,
    ) -> Result<Self, String> {
        let cache = Arc::new(CacheLayer::new(
            &cfg.environment,
            external,
            Duration::from_millis(cfg.cache.op_timeout_ms),
        ));
        cache.spawn_maintenance(
            Duration::from_millis(cfg.cache.reconnect_interval_ms),
            Duration::from_millis(cfg.cache.sweep_interval_ms),
            shutdown.clone(),
        );
        let hub = Arc::new(BroadcastHub::new(cfg.stream.channel_capacity));
        let conversations = Arc::new(ConversationStore::open(&cfg, cache.clone(), hub.clone())?);
        conversations
            .backfill_sequences()
            .await
            .map_err(|e| e.to_string())?;
        info!(
            store = %cfg.store.kind,
            cache = cache.health().as_str(),
            environment = %cfg.environment,
            "state initialized"
        );
        Ok(Self {
            cfg: Arc::new(cfg),
            conversations,
            cache,
            hub,
            shutdown,
        })
    }

    /// Appends one inbound or outbound turn within the ingest time budget.
    async fn ingest(&self, input: NewMessage) -> Result<AppendResponse, ApiError> {
        let budget = Duration::from_millis(self.cfg.ingest.timeout_ms);
        match tokio::time::timeout(budget, self.conversations.append_message(input)).await {
            Ok(Ok(appended)) => Ok(AppendResponse {
                message: appended.message,
                duplicate: appended.duplicate,
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                error!(timeout_ms = self.cfg.ingest.timeout_ms, "ingest timed out");
                Err(ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ingest_timeout",
                    "message could not be stored in time; retry the delivery",
                ))
            }
        }
    }

    fn sms_organization(&self, webhook: &SmsWebhook) -> Option<String> {
        if let Some(org) = webhook
            .organization_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some(org.to_string());
        }
        let numbers = &self.cfg.routing.numbers;
        normalize_phone(&webhook.to)
            .ok()
            .and_then(|to| numbers.get(&to))
            .or_else(|| numbers.get(webhook.to.trim()))
            .cloned()
    }
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }
}

impl From<ConversationError> for ApiError {
    fn from(e: ConversationError) -> Self {
        match e {
            ConversationError::Validation(message) => ApiError::validation(message),
            ConversationError::StoreUnavailable(message) => {
                error!(error = %message, "store unavailable");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    "conversation store unavailable",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: self.code.to_string(),
                    message: self.message,
                },
            }),
        )
            .into_response()
    }
}

async fn healthz(State(state): State<AppState>) -> Json<HealthView> {
    Json(HealthView {
        status: "ok".to_string(),
        api_version: API_VERSION.to_string(),
        cache: state.cache.health().as_str().to_string(),
    })
}

async fn sms_webhook(
    State(state): State<AppState>,
    Form(webhook): Form<SmsWebhook>,
) -> Result<Json<AppendResponse>, ApiError> {
    let organization_id = state.sms_organization(&webhook).ok_or_else(|| {
        warn!(to = %webhook.to, "sms for unrouted number rejected");
        ApiError::validation("organization could not be resolved for destination number")
    })?;
    let event = sms_event(webhook, &organization_id)
        .map_err(|e| ApiError::validation(e.to_string()))?;
    state.ingest(event.into_new_message()).await.map(Json)
}

async fn voice_transcript_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<VoiceTranscriptWebhook>,
) -> Result<Json<AppendResponse>, ApiError> {
    let call = match (&webhook.organization_id, &webhook.phone_number) {
        (Some(_), Some(_)) => None,
        _ => state.conversations.find_call(&webhook.conversation_id).await?,
    };
    let organization_id = webhook
        .organization_id
        .clone()
        .or_else(|| call.as_ref().map(|c| c.organization_id.clone()))
        .ok_or_else(|| ApiError::validation("organizationId is required for unknown calls"))?;
    let phone = webhook
        .phone_number
        .clone()
        .or_else(|| call.as_ref().map(|c| c.phone.clone()))
        .ok_or_else(|| ApiError::validation("phoneNumber is required for unknown calls"))?;
    let call_known = call.is_some();
    let mut webhook = webhook;
    if webhook.lead_id.is_none() {
        webhook.lead_id = call.and_then(|c| c.lead_id);
    }
    debug!(
        conversation_id = %webhook.conversation_id,
        registered_call = call_known,
        "transcript turn received"
    );
    let event = voice_event(webhook, &organization_id, &phone)
        .map_err(|e| ApiError::validation(e.to_string()))?;
    state.ingest(event.into_new_message()).await.map(Json)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    organization_id: Option<String>,
    phone_number: Option<String>,
}

async fn stream_conversation(
    State(state): State<AppState>,
    Path(lead_key): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let organization_id = query
        .organization_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::validation("organizationId query parameter is required"))?;
    let phone = match query.phone_number.as_deref().filter(|v| !v.trim().is_empty()) {
        Some(raw) => Some(
            normalize_phone(raw).map_err(|e| ApiError::validation(format!("phoneNumber: {e}")))?,
        ),
        None => None,
    };

    let key = state
        .conversations
        .resolve_lead_key(&organization_id, &lead_key, phone.as_deref())
        .await?;
    let registration = state.hub.register(&organization_id, &key);

    let thread_phone = match phone {
        Some(phone) => Some(phone),
        None => state
            .conversations
            .phone_for_lead_key(&organization_id, &key)
            .await
            .unwrap_or_default(),
    };
    let latest_sequence = match thread_phone.as_deref() {
        Some(phone) => state
            .conversations
            .latest_sequence(&organization_id, phone)
            .await
            .unwrap_or_default(),
        None => None,
    };
    info!(
        organization_id = %organization_id,
        requested = %lead_key,
        lead_key = %key,
        connection_id = %registration.connection_id,
        "stream subscribed"
    );

    let cancel = state.shutdown.child_token();
    let mut events = hub::spawn_connection(
        state.hub.clone(),
        state.cache.clone(),
        registration,
        latest_sequence,
        hub::ConnectionSettings {
            heartbeat_interval: Duration::from_millis(state.cfg.stream.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(state.cfg.stream.idle_timeout_ms),
        },
        cancel.clone(),
    );
    let guard = cancel.drop_guard();

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => warn!(error = %e, "stream event serialization failed"),
            }
        }
    };
    Ok(Sse::new(stream))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

async fn history(
    State(state): State<AppState>,
    Path((organization_id, phone)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiError> {
    state
        .conversations
        .get_history(
            &organization_id,
            &phone,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            query.cursor.as_deref(),
        )
        .await
        .map(Json)
        .map_err(ApiError::from)
}

async fn record_message(
    State(state): State<AppState>,
    Path((organization_id, phone)): Path<(String, String)>,
    Json(input): Json<OutboundMessageRequest>,
) -> Result<Json<AppendResponse>, ApiError> {
    if input.sent_by == SentBy::Lead {
        return Err(ApiError::validation(
            "lead turns arrive through the webhooks",
        ));
    }
    let message = NewMessage {
        organization_id,
        phone_number: phone,
        lead_id: input.lead_id,
        channel: input.channel,
        direction: input.sent_by.direction(),
        sent_by: input.sent_by,
        content: input.content,
        timestamp: input.timestamp,
        external_ref: input.external_ref,
    };
    state.ingest(message).await.map(Json)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextQuery {
    max_turns: Option<usize>,
    max_chars: Option<usize>,
}

async fn thread_context(
    State(state): State<AppState>,
    Path((organization_id, phone)): Path<(String, String)>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ContextResponse>, ApiError> {
    let phone = normalize_phone(&phone)
        .map_err(|e| ApiError::validation(format!("phone number: {e}")))?;
    let context = context::build_context(
        &state.conversations,
        &organization_id,
        &phone,
        query.max_turns.unwrap_or(state.cfg.context.max_turns),
        query.max_chars.unwrap_or(state.cfg.context.max_chars),
    )
    .await;
    Ok(Json(ContextResponse {
        organization_id,
        phone_number_normalized: phone,
        context,
    }))
}

async fn lead_context(
    State(state): State<AppState>,
    Path((organization_id, lead_key)): Path<(String, String)>,
    Query(query): Query<ContextQuery>,
) -> Json<ContextResponse> {
    let (phone, context) = context::build_context_for_lead(
        &state.conversations,
        &organization_id,
        &lead_key,
        query.max_turns.unwrap_or(state.cfg.context.max_turns),
        query.max_chars.unwrap_or(state.cfg.context.max_chars),
    )
    .await;
    Json(ContextResponse {
        organization_id,
        phone_number_normalized: phone.unwrap_or_default(),
        context,
    })
}

async fn initiate_call(
    State(state): State<AppState>,
    Json(input): Json<CallInitiation>,
) -> Result<Json<CallInitiationResponse>, ApiError> {
    let phone = normalize_phone(&input.phone_number)
        .map_err(|e| ApiError::validation(format!("phoneNumber: {e}")))?;
    let lead_id = state
        .conversations
        .register_call(
            &input.conversation_id,
            &input.organization_id,
            &phone,
            input.lead_id.as_deref(),
        )
        .await?;
    let context = context::build_context(
        &state.conversations,
        &input.organization_id,
        &phone,
        input.max_turns.unwrap_or(state.cfg.context.max_turns),
        input.max_chars.unwrap_or(state.cfg.context.max_chars),
    )
    .await;
    info!(
        conversation_id = %input.conversation_id,
        context_chars = context.chars().count(),
        "call initiated"
    );
    let mut dynamic_variables = BTreeMap::new();
    dynamic_variables.insert(CONTEXT_VARIABLE.to_string(), context);
    Ok(Json(CallInitiationResponse {
        conversation_id: input.conversation_id,
        lead_id,
        dynamic_variables,
    }))
}

async fn purge_thread(
    State(state): State<AppState>,
    Path((organization_id, phone)): Path<(String, String)>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let deleted = state
        .conversations
        .purge_thread(&organization_id, &phone)
        .await?;
    Ok(Json(PurgeResponse { deleted }))
}
