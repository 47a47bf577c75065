//! Content resolver: maps a decoded message envelope to a renderable
//! descriptor.
//!
//! Resolution is pure. Wrapper envelopes (edited, protocol, view-once,
//! ephemeral) are unwrapped recursively, quoted envelopes are resolved with
//! the same algorithm, and both share one depth budget of
//! [`MAX_UNWRAP_DEPTH`]. Anything that cannot be rendered becomes
//! [`RenderableContent::Unsupported`] with a non-empty debug string; the
//! resolver never fails.

use std::collections::HashMap;

use serde::Serialize;

use crate::media::{locate, MediaKind, MediaRef};
use crate::protocol::{ExtendedTextMessage, MediaMessage, MessagePayload, Quote, Wrapper};
use crate::storage::MessageRecord;

/// Maximum number of envelope levels unwrapped before giving up.
pub const MAX_UNWRAP_DEPTH: usize = 8;

const MAX_DEBUG_LEN: usize = 2048;

/// Where the envelope being resolved lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveContext<'a> {
    pub conversation_id: &'a str,
    pub message_id: &'a str,
    pub is_broadcast_channel: bool,
}

impl<'a> ResolveContext<'a> {
    fn for_message(&self, message_id: &'a str) -> Self {
        Self {
            message_id,
            ..*self
        }
    }
}

/// Fallback source for quoted envelopes that are referenced only by id.
pub trait QuoteLookup {
    fn find_payload(&self, conversation_id: &str, message_id: &str) -> Option<MessagePayload>;
}

/// In-memory index over one conversation's messages.
pub struct ConversationIndex<'a> {
    by_id: HashMap<&'a str, &'a MessageRecord>,
}

impl<'a> ConversationIndex<'a> {
    pub fn new(records: &'a [MessageRecord]) -> Self {
        Self {
            by_id: records.iter().map(|r| (r.message_id.as_str(), r)).collect(),
        }
    }
}

impl QuoteLookup for ConversationIndex<'_> {
    fn find_payload(&self, conversation_id: &str, message_id: &str) -> Option<MessagePayload> {
        self.by_id
            .get(message_id)
            .filter(|r| r.conversation_id == conversation_id)
            .map(|r| MessagePayload::decode(&r.payload))
    }
}

/// Renderable form of a message. Produced fresh on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderableContent {
    PlainText {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted: Option<Box<QuotedContent>>,
    },
    Image {
        locator: Option<MediaRef>,
        caption: Option<String>,
    },
    Video {
        locator: Option<MediaRef>,
        caption: Option<String>,
    },
    Sticker {
        locator: Option<MediaRef>,
    },
    Document {
        locator: Option<MediaRef>,
        file_name: Option<String>,
        mimetype: Option<String>,
    },
    Reaction {
        text: String,
        target_id: Option<String>,
    },
    Unsupported {
        debug: String,
    },
}

impl RenderableContent {
    pub fn locator(&self) -> Option<&MediaRef> {
        match self {
            RenderableContent::Image { locator, .. }
            | RenderableContent::Video { locator, .. }
            | RenderableContent::Sticker { locator }
            | RenderableContent::Document { locator, .. } => locator.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotedContent {
    pub message_id: Option<String>,
    pub participant: Option<String>,
    pub content: RenderableContent,
}

/// Resolve an envelope without quote lookup.
pub fn resolve(payload: &MessagePayload, ctx: &ResolveContext<'_>) -> RenderableContent {
    resolve_at(payload, ctx, None, 0)
}

/// Resolve an envelope, consulting `quotes` for quoted messages that are
/// referenced only by id.
pub fn resolve_with_quotes(
    payload: &MessagePayload,
    ctx: &ResolveContext<'_>,
    quotes: &dyn QuoteLookup,
) -> RenderableContent {
    resolve_at(payload, ctx, Some(quotes), 0)
}

fn resolve_at(
    payload: &MessagePayload,
    ctx: &ResolveContext<'_>,
    quotes: Option<&dyn QuoteLookup>,
    depth: usize,
) -> RenderableContent {
    match payload {
        MessagePayload::Conversation(text) => RenderableContent::PlainText {
            text: text.clone(),
            quoted: None,
        },
        MessagePayload::ExtendedText(ext) => resolve_extended_text(ext, ctx, quotes, depth),
        MessagePayload::Image(media) => RenderableContent::Image {
            locator: locate(MediaKind::Image, ctx, media),
            caption: non_empty(&media.caption),
        },
        MessagePayload::Video(media) => RenderableContent::Video {
            locator: locate(MediaKind::Video, ctx, media),
            caption: non_empty(&media.caption),
        },
        MessagePayload::Sticker(media) => RenderableContent::Sticker {
            locator: locate(MediaKind::Sticker, ctx, media),
        },
        MessagePayload::Document(media) => resolve_document(media, ctx),
        MessagePayload::Reaction(reaction) => RenderableContent::Reaction {
            text: reaction.text.clone().unwrap_or_default(),
            target_id: reaction.key.as_ref().and_then(|k| k.id.clone()),
        },
        MessagePayload::Edited(w)
        | MessagePayload::ViewOnce(w)
        | MessagePayload::ViewOnceV2(w)
        | MessagePayload::ViewOnceV2Extension(w)
        | MessagePayload::Ephemeral(w) => unwrap_wrapper(payload, w, ctx, quotes, depth),
        MessagePayload::Protocol(proto) => match &proto.edited {
            Some(inner) => descend(payload, inner, ctx, quotes, depth),
            None => unsupported(payload),
        },
        MessagePayload::Unmodeled { .. } => unsupported(payload),
    }
}

fn unwrap_wrapper(
    outer: &MessagePayload,
    wrapper: &Wrapper,
    ctx: &ResolveContext<'_>,
    quotes: Option<&dyn QuoteLookup>,
    depth: usize,
) -> RenderableContent {
    match &wrapper.inner {
        Some(inner) => descend(outer, inner, ctx, quotes, depth),
        None => unsupported(outer),
    }
}

fn descend(
    outer: &MessagePayload,
    inner: &MessagePayload,
    ctx: &ResolveContext<'_>,
    quotes: Option<&dyn QuoteLookup>,
    depth: usize,
) -> RenderableContent {
    if depth >= MAX_UNWRAP_DEPTH {
        return RenderableContent::Unsupported {
            debug: format!(
                "{}: nesting exceeds {MAX_UNWRAP_DEPTH} levels",
                outer.kind_name()
            ),
        };
    }
    resolve_at(inner, ctx, quotes, depth + 1)
}

fn resolve_extended_text(
    ext: &ExtendedTextMessage,
    ctx: &ResolveContext<'_>,
    quotes: Option<&dyn QuoteLookup>,
    depth: usize,
) -> RenderableContent {
    let quoted = ext
        .quote
        .as_ref()
        .and_then(|quote| resolve_quote(quote, ctx, quotes, depth))
        .map(Box::new);
    RenderableContent::PlainText {
        text: ext.text.clone(),
        quoted,
    }
}

fn resolve_quote(
    quote: &Quote,
    ctx: &ResolveContext<'_>,
    quotes: Option<&dyn QuoteLookup>,
    depth: usize,
) -> Option<QuotedContent> {
    let quoted_ctx = ctx.for_message(quote.stanza_id.as_deref().unwrap_or(""));

    let looked_up;
    let payload = match (&quote.message, &quote.stanza_id, quotes) {
        (Some(message), _, _) => &**message,
        (None, Some(stanza_id), Some(lookup)) => {
            looked_up = lookup.find_payload(ctx.conversation_id, stanza_id)?;
            &looked_up
        }
        _ => return None,
    };

    let content = if depth >= MAX_UNWRAP_DEPTH {
        RenderableContent::Unsupported {
            debug: format!("quote: nesting exceeds {MAX_UNWRAP_DEPTH} levels"),
        }
    } else {
        resolve_at(payload, &quoted_ctx, quotes, depth + 1)
    };

    Some(QuotedContent {
        message_id: quote.stanza_id.clone(),
        participant: quote.participant.clone(),
        content,
    })
}

fn resolve_document(media: &MediaMessage, ctx: &ResolveContext<'_>) -> RenderableContent {
    RenderableContent::Document {
        locator: locate(MediaKind::Document, ctx, media),
        file_name: non_empty(&media.file_name),
        mimetype: non_empty(&media.mimetype),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// `Unsupported` carrying a debug projection of `payload`.
fn unsupported(payload: &MessagePayload) -> RenderableContent {
    RenderableContent::Unsupported {
        debug: debug_projection(payload),
    }
}

/// Short, never-empty description of an envelope for diagnostics.
pub fn debug_projection(payload: &MessagePayload) -> String {
    let kind = payload.kind_name();
    let body = match payload {
        MessagePayload::Unmodeled { raw, .. } => String::from_utf8_lossy(raw).into_owned(),
        MessagePayload::Edited(w)
        | MessagePayload::ViewOnce(w)
        | MessagePayload::ViewOnceV2(w)
        | MessagePayload::ViewOnceV2Extension(w)
        | MessagePayload::Ephemeral(w) => w.raw.to_string(),
        MessagePayload::Protocol(p) => p.raw.to_string(),
        other => format!("{other:?}"),
    };
    let mut out = format!("{kind}: {body}");
    if out.len() > MAX_DEBUG_LEN {
        let mut cut = MAX_DEBUG_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push('…');
    }
    out
}
