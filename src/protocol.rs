//! Transport wire types and the message envelope model.
//!
//! ## Summary
//! - The transport delivers JSON event documents tagged by `type`
//!   ([`TransportEvent`]): live upserts, history-sync batches and contact
//!   updates.
//! - Each [`WireMessage`] carries a `message` object whose single meaningful
//!   key names the message kind (`conversation`, `imageMessage`,
//!   `ephemeralMessage`, ...). That object is persisted verbatim as the
//!   message payload.
//! - [`MessagePayload`] is the decoded form of a persisted payload: one
//!   variant per modeled kind, wrappers holding their inner envelope, and an
//!   `Unmodeled` catch-all for kinds this crate does not know about.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host that serves encrypted media blobs referenced by `directPath`.
pub const MEDIA_HOST: &str = "https://mmg.whatsapp.net";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid transport event: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Conversation kinds
// ---------------------------------------------------------------------------

/// Kind of conversation, derived from the suffix of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Status,
    Channel,
    Unknown,
}

impl ConversationKind {
    pub fn from_conversation_id(conversation_id: &str) -> Self {
        if conversation_id.ends_with("@g.us") {
            ConversationKind::Group
        } else if conversation_id.ends_with("@s.whatsapp.net") || conversation_id.ends_with("@lid") {
            ConversationKind::Direct
        } else if conversation_id.ends_with("@broadcast") {
            ConversationKind::Status
        } else if conversation_id.ends_with("@newsletter") {
            ConversationKind::Channel
        } else {
            ConversationKind::Unknown
        }
    }

    /// Channels publish media at plaintext upstream URLs.
    pub fn is_broadcast_channel(self) -> bool {
        self == ConversationKind::Channel
    }
}

// ---------------------------------------------------------------------------
// Transport events
// ---------------------------------------------------------------------------

/// One event document received from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportEvent {
    #[serde(rename = "messages.upsert")]
    LiveUpsert {
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    #[serde(rename = "messaging-history.set")]
    HistoryBatch {
        #[serde(default)]
        messages: Vec<WireMessage>,
        #[serde(default)]
        contacts: Vec<WireContact>,
        #[serde(rename = "isFinal", default)]
        is_final: bool,
    },
    #[serde(rename = "contacts.upsert")]
    ContactUpsert {
        #[serde(default)]
        contacts: Vec<WireContact>,
    },
}

impl TransportEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Identifies a message within the transport's namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from_me: Option<bool>,
}

/// Timestamps arrive as plain numbers, decimal strings, or protobuf longs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Seconds(i64),
    Text(String),
    Long { low: i64, high: i64 },
}

impl WireTimestamp {
    pub fn as_seconds(&self) -> Option<i64> {
        match self {
            WireTimestamp::Seconds(s) => Some(*s),
            WireTimestamp::Text(s) => s.trim().parse().ok(),
            WireTimestamp::Long { low, high } => Some((*high << 32) | (*low as u32 as i64)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub message_timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireContact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notify: Option<String>,
    #[serde(default)]
    pub img_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Envelope model
// ---------------------------------------------------------------------------

/// Fields shared by every media-bearing message kind.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Base64 media key used by the transport to decrypt the blob.
    #[serde(default)]
    pub media_key: Option<String>,
    #[serde(default)]
    pub direct_path: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReactionMessage {
    #[serde(default)]
    pub key: Option<MessageKey>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Reference to a quoted message carried by an extended text message.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub stanza_id: Option<String>,
    pub participant: Option<String>,
    pub message: Option<Box<MessagePayload>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedTextMessage {
    pub text: String,
    pub quote: Option<Quote>,
}

/// An envelope whose only job is to carry another envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Wrapper {
    pub inner: Option<Box<MessagePayload>>,
    /// The wrapper's own JSON, kept for debug projections.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    /// Control type, e.g. `REVOKE` or `MESSAGE_EDIT` (numeric on some transports).
    pub kind: Option<String>,
    pub target_id: Option<String>,
    pub edited: Option<Box<MessagePayload>>,
    pub raw: Value,
}

/// Decoded message content, one variant per modeled kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Conversation(String),
    Image(MediaMessage),
    Video(MediaMessage),
    Sticker(MediaMessage),
    Document(MediaMessage),
    Reaction(ReactionMessage),
    ExtendedText(ExtendedTextMessage),
    Edited(Wrapper),
    Protocol(ProtocolMessage),
    ViewOnce(Wrapper),
    ViewOnceV2(Wrapper),
    ViewOnceV2Extension(Wrapper),
    Ephemeral(Wrapper),
    Unmodeled { kind: String, raw: Vec<u8> },
}

/// Keys that ride along with real content and never name the kind.
const HOUSEKEEPING_KEYS: &[&str] = &["messageContextInfo", "senderKeyDistributionMessage"];

/// Modeled keys in the order they are probed.
const MODELED_KEYS: &[&str] = &[
    "conversation",
    "extendedTextMessage",
    "imageMessage",
    "videoMessage",
    "stickerMessage",
    "documentMessage",
    "reactionMessage",
    "editedMessage",
    "protocolMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "ephemeralMessage",
];

impl MessagePayload {
    /// Decode persisted payload bytes. Never fails: anything that is not a
    /// modeled kind becomes [`MessagePayload::Unmodeled`].
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value(&value),
            Err(_) => MessagePayload::Unmodeled {
                kind: "undecodable".to_string(),
                raw: bytes.to_vec(),
            },
        }
    }

    /// Classify a message content object.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return unmodeled("non_object", value);
        };

        for key in MODELED_KEYS {
            let Some(inner) = obj.get(*key) else { continue };
            if inner.is_null() {
                continue;
            }
            if let Some(payload) = decode_kind(key, inner) {
                return payload;
            }
            return unmodeled(key, value);
        }

        let kind = obj
            .iter()
            .find(|(k, v)| !HOUSEKEEPING_KEYS.contains(&k.as_str()) && !v.is_null())
            .map(|(k, _)| k.as_str())
            .unwrap_or("empty");
        unmodeled(kind, value)
    }

    /// The transport's name for this kind.
    pub fn kind_name(&self) -> &str {
        match self {
            MessagePayload::Conversation(_) => "conversation",
            MessagePayload::Image(_) => "imageMessage",
            MessagePayload::Video(_) => "videoMessage",
            MessagePayload::Sticker(_) => "stickerMessage",
            MessagePayload::Document(_) => "documentMessage",
            MessagePayload::Reaction(_) => "reactionMessage",
            MessagePayload::ExtendedText(_) => "extendedTextMessage",
            MessagePayload::Edited(_) => "editedMessage",
            MessagePayload::Protocol(_) => "protocolMessage",
            MessagePayload::ViewOnce(_) => "viewOnceMessage",
            MessagePayload::ViewOnceV2(_) => "viewOnceMessageV2",
            MessagePayload::ViewOnceV2Extension(_) => "viewOnceMessageV2Extension",
            MessagePayload::Ephemeral(_) => "ephemeralMessage",
            MessagePayload::Unmodeled { kind, .. } => kind.as_str(),
        }
    }
}

fn unmodeled(kind: &str, value: &Value) -> MessagePayload {
    MessagePayload::Unmodeled {
        kind: kind.to_string(),
        raw: serde_json::to_vec(value).unwrap_or_default(),
    }
}

/// Decode the value under one modeled key. `None` means the value did not
/// have the expected shape.
fn decode_kind(key: &str, inner: &Value) -> Option<MessagePayload> {
    let payload = match key {
        "conversation" => MessagePayload::Conversation(inner.as_str()?.to_string()),
        "extendedTextMessage" => MessagePayload::ExtendedText(decode_extended_text(inner)?),
        "imageMessage" => MessagePayload::Image(serde_json::from_value(inner.clone()).ok()?),
        "videoMessage" => MessagePayload::Video(serde_json::from_value(inner.clone()).ok()?),
        "stickerMessage" => MessagePayload::Sticker(serde_json::from_value(inner.clone()).ok()?),
        "documentMessage" => MessagePayload::Document(serde_json::from_value(inner.clone()).ok()?),
        "reactionMessage" => MessagePayload::Reaction(serde_json::from_value(inner.clone()).ok()?),
        "editedMessage" => MessagePayload::Edited(decode_wrapper(inner)?),
        "protocolMessage" => MessagePayload::Protocol(decode_protocol(inner)?),
        "viewOnceMessage" => MessagePayload::ViewOnce(decode_wrapper(inner)?),
        "viewOnceMessageV2" => MessagePayload::ViewOnceV2(decode_wrapper(inner)?),
        "viewOnceMessageV2Extension" => MessagePayload::ViewOnceV2Extension(decode_wrapper(inner)?),
        "ephemeralMessage" => MessagePayload::Ephemeral(decode_wrapper(inner)?),
        _ => return None,
    };
    Some(payload)
}

fn nested(value: Option<&Value>) -> Option<Box<MessagePayload>> {
    value
        .filter(|v| !v.is_null())
        .map(|v| Box::new(MessagePayload::from_value(v)))
}

fn decode_wrapper(inner: &Value) -> Option<Wrapper> {
    let obj = inner.as_object()?;
    Some(Wrapper {
        inner: nested(obj.get("message")),
        raw: inner.clone(),
    })
}

fn decode_protocol(inner: &Value) -> Option<ProtocolMessage> {
    let obj = inner.as_object()?;
    let kind = obj.get("type").and_then(|t| match t {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let target_id = obj
        .get("key")
        .and_then(|k| k.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ProtocolMessage {
        kind,
        target_id,
        edited: nested(obj.get("editedMessage")),
        raw: inner.clone(),
    })
}

fn decode_extended_text(inner: &Value) -> Option<ExtendedTextMessage> {
    let obj = inner.as_object()?;
    let text = obj
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let quote = obj.get("contextInfo").and_then(Value::as_object).and_then(|ctx| {
        let stanza_id = ctx.get("stanzaId").and_then(Value::as_str).map(str::to_string);
        let participant = ctx
            .get("participant")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = nested(ctx.get("quotedMessage"));
        if stanza_id.is_none() && message.is_none() {
            return None;
        }
        Some(Quote {
            stanza_id,
            participant,
            message,
        })
    });
    Some(ExtendedTextMessage { text, quote })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
