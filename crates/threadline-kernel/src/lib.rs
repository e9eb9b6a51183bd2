use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use threadline_contracts::{
    InboundEvent, Message, SentBy, SmsEvent, SmsWebhook, VoiceTranscriptEvent,
    VoiceTranscriptWebhook,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("phone number has {0} digits; expected 10 (NANP) or 8-15 with country code")]
    BadLength(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cursor: {0}")]
pub struct CursorError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EventError(pub String);

/// Canonical E.164-like form: `+` followed by 8-15 digits. Bare 10-digit
/// numbers and 11-digit numbers starting with `1` are treated as NANP.
pub fn normalize_phone(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }

    let mut digits = String::with_capacity(trimmed.len());
    let mut has_plus = false;
    for (idx, ch) in trimmed.chars().enumerate() {
        match ch {
            '0'..='9' => digits.push(ch),
            '+' if idx == 0 => has_plus = true,
            ' ' | '-' | '.' | '(' | ')' => {}
            other => return Err(PhoneError::InvalidCharacter(other)),
        }
    }

    match (has_plus, digits.len()) {
        (_, 0) => Err(PhoneError::Empty),
        (false, 10) => Ok(format!("+1{digits}")),
        (false, 11) if digits.starts_with('1') => Ok(format!("+{digits}")),
        (true, 8..=15) => Ok(format!("+{digits}")),
        (_, n) => Err(PhoneError::BadLength(n)),
    }
}

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn format_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn rfc3339_millis(ts: &str) -> Option<i64> {
    parse_rfc3339(ts).map(|v| v.timestamp_millis())
}

/// Total order of a thread: source timestamp, then server sequence, then
/// receipt time, then id. Field order matters for the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderingKey {
    pub timestamp_ms: i64,
    pub sequence_number: i64,
    pub created_at_ms: i64,
    pub id: String,
}

impl OrderingKey {
    pub fn of(message: &Message) -> Option<Self> {
        Some(Self {
            timestamp_ms: rfc3339_millis(&message.timestamp)?,
            sequence_number: message.sequence_number,
            created_at_ms: rfc3339_millis(&message.created_at)?,
            id: message.id.clone(),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.timestamp_ms, self.sequence_number, self.created_at_ms, self.id
        )
    }

    pub fn decode(cursor: &str) -> Result<Self, CursorError> {
        let mut parts = cursor.splitn(4, '_');
        let mut next_i64 = |name: &str| -> Result<i64, CursorError> {
            parts
                .next()
                .ok_or_else(|| CursorError(format!("missing {name}")))?
                .parse::<i64>()
                .map_err(|e| CursorError(format!("{name}: {e}")))
        };
        let timestamp_ms = next_i64("timestamp")?;
        let sequence_number = next_i64("sequence")?;
        let created_at_ms = next_i64("created_at")?;
        let id = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CursorError("missing id".to_string()))?
            .to_string();
        Ok(Self {
            timestamp_ms,
            sequence_number,
            created_at_ms,
            id,
        })
    }
}

pub fn speaker_label(sent_by: SentBy) -> &'static str {
    match sent_by {
        SentBy::Lead => "Customer",
        SentBy::Agent => "AI Assistant",
        SentBy::HumanAgent => "Sales Rep",
        SentBy::System => "System",
    }
}

/// Renders turns (already in ascending order) one per line, dropping whole
/// turns from the oldest end until the text fits in `max_chars` characters.
pub fn render_context(messages: &[Message], max_chars: usize) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| format!("{}: {}", speaker_label(m.sent_by), m.content.trim()))
        .collect();
    let lengths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();

    let mut start = 0;
    let mut total: usize = lengths.iter().sum::<usize>() + lines.len().saturating_sub(1);
    while start < lines.len() && total > max_chars {
        total -= lengths[start];
        if start + 1 < lines.len() {
            total -= 1;
        }
        start += 1;
    }
    lines[start..].join("\n")
}

/// Canonical lead ids are UUIDs; anything else ("demo-42") is an alias.
pub fn is_canonical_lead_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id.trim()).is_ok()
}

pub fn parse_speaker(speaker: &str) -> Option<SentBy> {
    match speaker.trim().to_ascii_lowercase().as_str() {
        "user" | "lead" | "customer" => Some(SentBy::Lead),
        "agent" | "ai" | "assistant" => Some(SentBy::Agent),
        "human_agent" | "rep" => Some(SentBy::HumanAgent),
        "system" => Some(SentBy::System),
        _ => None,
    }
}

pub fn cache_key(environment: &str, organization_id: &str, logical_name: &str) -> String {
    format!("{environment}:{organization_id}:{logical_name}")
}

pub fn window_cache_name(phone: &str) -> String {
    format!("window:{phone}")
}

pub fn lead_cache_name(phone: &str) -> String {
    format!("lead:{phone}")
}

pub fn presence_cache_name(lead_key: &str, connection_id: &str) -> String {
    format!("live:{lead_key}:{connection_id}")
}

/// Subscription key used when no lead is known for a phone thread.
pub fn phone_subscription_key(phone: &str) -> String {
    format!("phone:{phone}")
}

pub fn thread_key(organization_id: &str, phone: &str) -> String {
    format!("{organization_id}:{phone}")
}

/// Dedup key for a transcript turn; the voice runtime has no per-turn id.
pub fn voice_external_ref(conversation_id: &str, timestamp: &str, speaker: SentBy, text: &str) -> String {
    hash_id(
        &format!("voice:{conversation_id}"),
        &[timestamp, speaker.as_str(), text.trim()],
    )
}

pub fn sms_event(webhook: SmsWebhook, organization_id: &str) -> Result<InboundEvent, EventError> {
    if organization_id.trim().is_empty() {
        return Err(EventError("organization could not be resolved".to_string()));
    }
    let phone = normalize_phone(&webhook.from).map_err(|e| EventError(format!("from: {e}")))?;
    if webhook.body.trim().is_empty() {
        return Err(EventError("body must not be empty".to_string()));
    }
    Ok(InboundEvent::Sms(SmsEvent {
        organization_id: organization_id.to_string(),
        phone_number_normalized: phone,
        body: webhook.body,
        provider_message_id: webhook
            .provider_message_id
            .filter(|v| !v.trim().is_empty()),
    }))
}

pub fn voice_event(
    webhook: VoiceTranscriptWebhook,
    organization_id: &str,
    phone: &str,
) -> Result<InboundEvent, EventError> {
    if organization_id.trim().is_empty() {
        return Err(EventError("organization could not be resolved".to_string()));
    }
    if webhook.conversation_id.trim().is_empty() {
        return Err(EventError("conversationId is required".to_string()));
    }
    let phone = normalize_phone(phone).map_err(|e| EventError(format!("phoneNumber: {e}")))?;
    let sent_by = parse_speaker(&webhook.speaker)
        .ok_or_else(|| EventError(format!("unknown speaker {:?}", webhook.speaker)))?;
    if webhook.text.trim().is_empty() {
        return Err(EventError("text must not be empty".to_string()));
    }
    let timestamp = parse_rfc3339(&webhook.timestamp)
        .ok_or_else(|| EventError("timestamp must be RFC3339".to_string()))?
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let external_ref =
        voice_external_ref(&webhook.conversation_id, &timestamp, sent_by, &webhook.text);
    Ok(InboundEvent::VoiceTranscript(VoiceTranscriptEvent {
        organization_id: organization_id.to_string(),
        phone_number_normalized: phone,
        conversation_id: webhook.conversation_id,
        lead_id: webhook.lead_id.filter(|v| !v.trim().is_empty()),
        sent_by,
        text: webhook.text,
        timestamp,
        external_ref,
    }))
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}:{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use threadline_contracts::Channel;

    fn msg(id: &str, seq: i64, ts: &str, sent_by: SentBy, content: &str) -> Message {
        Message {
            id: id.to_string(),
            organization_id: "org-a".to_string(),
            lead_id: None,
            phone_number_normalized: "+15550000000".to_string(),
            channel: Channel::Sms,
            direction: sent_by.direction(),
            sent_by,
            content: content.to_string(),
            timestamp: ts.to_string(),
            sequence_number: seq,
            created_at: ts.to_string(),
            external_ref: None,
        }
    }

    #[test]
    fn normalizes_common_us_formats() {
        assert_eq!(normalize_phone("(555) 000-0000").unwrap(), "+15550000000");
        assert_eq!(normalize_phone("1-555-000-0000").unwrap(), "+15550000000");
        assert_eq!(normalize_phone("+1 555.000.0000").unwrap(), "+15550000000");
        assert_eq!(normalize_phone("+447700900123").unwrap(), "+447700900123");
    }

    #[test]
    fn rejects_malformed_phones() {
        assert_eq!(normalize_phone("  "), Err(PhoneError::Empty));
        assert_eq!(normalize_phone("555-0000"), Err(PhoneError::BadLength(7)));
        assert_eq!(
            normalize_phone("555x0000000"),
            Err(PhoneError::InvalidCharacter('x'))
        );
        assert!(normalize_phone("1+5550000000").is_err());
    }

    #[test]
    fn cursor_round_trips_ids_with_separators() {
        let key = OrderingKey {
            timestamp_ms: 1_771_027_200_000,
            sequence_number: 12,
            created_at_ms: 1_771_027_200_050,
            id: "msg_a_b".to_string(),
        };
        assert_eq!(OrderingKey::decode(&key.encode()).unwrap(), key);
        assert!(OrderingKey::decode("12_x_3_id").is_err());
        assert!(OrderingKey::decode("1_2_3_").is_err());
    }

    #[test]
    fn equal_timestamps_fall_back_to_sequence() {
        let ts = "2026-02-14T00:00:00.000Z";
        let hello = msg("a", 2, ts, SentBy::Agent, "Hello");
        let hi = msg("b", 1, ts, SentBy::Lead, "Hi");
        let hello_key = OrderingKey::of(&hello).unwrap();
        let hi_key = OrderingKey::of(&hi).unwrap();
        assert_eq!(hello_key.timestamp_ms, hi_key.timestamp_ms);
        assert!(hi_key < hello_key);
    }

    #[test]
    fn context_drops_whole_turns_from_the_oldest_end() {
        let ts = "2026-02-14T00:00:00.000Z";
        let thread = vec![
            msg("1", 1, ts, SentBy::Lead, "Is the truck still available?"),
            msg("2", 2, ts, SentBy::Agent, "Yes it is."),
            msg("3", 3, ts, SentBy::Lead, "Great"),
        ];
        let full = render_context(&thread, 10_000);
        assert_eq!(
            full,
            "Customer: Is the truck still available?\nAI Assistant: Yes it is.\nCustomer: Great"
        );

        let budget = "AI Assistant: Yes it is.\nCustomer: Great".chars().count();
        assert_eq!(
            render_context(&thread, budget),
            "AI Assistant: Yes it is.\nCustomer: Great"
        );
        assert_eq!(render_context(&thread, budget - 1), "Customer: Great");
        assert_eq!(render_context(&thread, 3), "");
    }

    #[test]
    fn lead_ids_are_classified() {
        assert!(is_canonical_lead_id("0b7f8a62-3c1e-4d2a-9b8e-1f2d3c4b5a69"));
        assert!(!is_canonical_lead_id("demo-42"));
        assert!(!is_canonical_lead_id(""));
    }

    #[test]
    fn voice_event_requires_known_speaker_and_rfc3339() {
        let webhook = VoiceTranscriptWebhook {
            conversation_id: "conv-1".to_string(),
            lead_id: None,
            phone_number: None,
            speaker: "user".to_string(),
            text: "Hello".to_string(),
            timestamp: "2026-02-14T00:00:00Z".to_string(),
            organization_id: None,
        };
        let event = voice_event(webhook.clone(), "org-a", "5550000000").unwrap();
        match event {
            InboundEvent::VoiceTranscript(e) => {
                assert_eq!(e.sent_by, SentBy::Lead);
                assert_eq!(e.timestamp, "2026-02-14T00:00:00.000Z");
                assert_eq!(e.phone_number_normalized, "+15550000000");
                assert!(e.external_ref.starts_with("voice:conv-1:"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let mut bad = webhook.clone();
        bad.speaker = "narrator".to_string();
        assert!(voice_event(bad, "org-a", "5550000000").is_err());

        let mut bad = webhook;
        bad.timestamp = "yesterday".to_string();
        assert!(voice_event(bad, "org-a", "5550000000").is_err());
    }

    #[test]
    fn voice_external_ref_is_stable_for_redelivery() {
        let a = voice_external_ref("conv-1", "2026-02-14T00:00:00.000Z", SentBy::Agent, "Hi ");
        let b = voice_external_ref("conv-1", "2026-02-14T00:00:00.000Z", SentBy::Agent, "Hi");
        assert_eq!(a, b);
        assert_ne!(
            a,
            voice_external_ref("conv-1", "2026-02-14T00:00:00.000Z", SentBy::Lead, "Hi")
        );
    }

    #[test]
    fn sms_event_rejects_blank_body_and_missing_org() {
        let webhook = SmsWebhook {
            from: "+15550000000".to_string(),
            to: "+15557654321".to_string(),
            body: "   ".to_string(),
            provider_message_id: Some("SM1".to_string()),
            organization_id: None,
        };
        assert!(sms_event(webhook.clone(), "org-a").is_err());
        let mut ok = webhook;
        ok.body = "Hi".to_string();
        assert!(sms_event(ok.clone(), "").is_err());
        assert!(matches!(sms_event(ok, "org-a"), Ok(InboundEvent::Sms(_))));
    }

    #[test]
    fn cache_keys_are_tenant_prefixed() {
        assert_eq!(
            cache_key("prod", "org-a", &window_cache_name("+15550000000")),
            "prod:org-a:window:+15550000000"
        );
        assert_ne!(
            cache_key("prod", "org-a", "lead:+1"),
            cache_key("prod", "org-b", "lead:+1")
        );
    }

    proptest! {
        #[test]
        fn normalized_phones_are_fixed_points(digits in "[2-9][0-9]{9}") {
            let once = normalize_phone(&digits).unwrap();
            prop_assert_eq!(normalize_phone(&once).unwrap(), once.clone());
            prop_assert!(once.starts_with("+1"));
            prop_assert_eq!(once.len(), 12);
        }

        #[test]
        fn rendered_context_never_exceeds_budget(
            contents in proptest::collection::vec("[a-z ]{1,40}", 0..20),
            max_chars in 0usize..400,
        ) {
            let ts = "2026-02-14T00:00:00.000Z";
            let thread: Vec<Message> = contents
                .iter()
                .enumerate()
                .map(|(i, c)| msg(&i.to_string(), i as i64 + 1, ts, SentBy::Lead, c))
                .collect();
            let rendered = render_context(&thread, max_chars);
            prop_assert!(rendered.chars().count() <= max_chars);
            for line in rendered.lines() {
                prop_assert!(line.starts_with("Customer: "));
            }
        }
    }

    #[test]
    fn formats_millis_in_utc() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(rfc3339_millis("1970-01-01T00:00:01.5+00:00"), Some(1_500));
    }
}
