use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

/// Context variable name handed to the voice agent at call initiation.
pub const CONTEXT_VARIABLE: &str = "conversation_context";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Voice,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SentBy {
    Lead,
    Agent,
    System,
    HumanAgent,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sms" => Some(Channel::Sms),
            "voice" => Some(Channel::Voice),
            _ => None,
        }
    }
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

impl SentBy {
    pub fn as_str(self) -> &'static str {
        match self {
            SentBy::Lead => "lead",
            SentBy::Agent => "agent",
            SentBy::System => "system",
            SentBy::HumanAgent => "human_agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lead" => Some(SentBy::Lead),
            "agent" => Some(SentBy::Agent),
            "system" => Some(SentBy::System),
            "human_agent" => Some(SentBy::HumanAgent),
            _ => None,
        }
    }

    /// Direction implied by who produced the turn.
    pub fn direction(self) -> Direction {
        match self {
            SentBy::Lead => Direction::Inbound,
            SentBy::Agent | SentBy::System | SentBy::HumanAgent => Direction::Outbound,
        }
    }
}

/// One durable conversation turn. Timestamps are RFC3339 UTC with millisecond
/// precision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    pub phone_number_normalized: String,
    pub channel: Channel,
    pub direction: Direction,
    pub sent_by: SentBy,
    pub content: String,
    pub timestamp: String,
    pub sequence_number: i64,
    pub created_at: String,
    #[serde(default)]
    pub external_ref: Option<String>,
}

/// Input to the conversation store before normalization and sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub organization_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    pub channel: Channel,
    pub direction: Direction,
    pub sent_by: SentBy,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub external_ref: Option<String>,
}

/// Form body posted by the SMS gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsWebhook {
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// JSON body posted by the voice agent runtime for each transcript turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceTranscriptWebhook {
    pub conversation_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub speaker: String,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsEvent {
    pub organization_id: String,
    pub phone_number_normalized: String,
    pub body: String,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceTranscriptEvent {
    pub organization_id: String,
    pub phone_number_normalized: String,
    pub conversation_id: String,
    pub lead_id: Option<String>,
    pub sent_by: SentBy,
    pub text: String,
    pub timestamp: String,
    pub external_ref: String,
}

/// Webhook payloads after boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Sms(SmsEvent),
    VoiceTranscript(VoiceTranscriptEvent),
}

impl InboundEvent {
    pub fn into_new_message(self) -> NewMessage {
        match self {
            InboundEvent::Sms(e) => NewMessage {
                organization_id: e.organization_id,
                phone_number: e.phone_number_normalized,
                lead_id: None,
                channel: Channel::Sms,
                direction: Direction::Inbound,
                sent_by: SentBy::Lead,
                content: e.body,
                timestamp: None,
                external_ref: e.provider_message_id,
            },
            InboundEvent::VoiceTranscript(e) => NewMessage {
                organization_id: e.organization_id,
                phone_number: e.phone_number_normalized,
                lead_id: e.lead_id,
                channel: Channel::Voice,
                direction: e.sent_by.direction(),
                sent_by: e.sent_by,
                content: e.text,
                timestamp: Some(e.timestamp),
                external_ref: Some(e.external_ref),
            },
        }
    }
}

/// Records pushed over the conversation stream, one per SSE `data:` line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Connected {
        connection_id: String,
        organization_id: String,
        lead_key: String,
        #[serde(default)]
        latest_sequence: Option<i64>,
        timestamp: String,
    },
    Message {
        message: Message,
    },
    Heartbeat {
        timestamp: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub message: Message,
    pub duplicate: bool,
}

/// Outbound turn recorded by the dashboard (human agent) or the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutboundMessageRequest {
    pub content: String,
    pub sent_by: SentBy,
    #[serde(default = "default_outbound_channel")]
    pub channel: Channel,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub external_ref: Option<String>,
}

fn default_outbound_channel() -> Channel {
    Channel::Sms
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallInitiation {
    pub organization_id: String,
    pub phone_number: String,
    pub conversation_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub max_turns: Option<usize>,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiationResponse {
    pub conversation_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    pub dynamic_variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub organization_id: String,
    pub phone_number_normalized: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthView {
    pub status: String,
    pub api_version: String,
    pub cache: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
