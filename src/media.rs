//! Media locator and on-demand media fetch.
//!
//! Media bytes never touch the store. [`locate`] decides how a media-bearing
//! envelope can be fetched later; [`plan_fetch`] re-reads the message and
//! turns that decision into a concrete request, which a [`MediaTransport`]
//! executes.

use std::io::Read;

use base64::Engine as _;
use serde::Serialize;

use crate::content::{ResolveContext, MAX_UNWRAP_DEPTH};
use crate::protocol::{ConversationKind, MediaMessage, MessagePayload, MEDIA_HOST};
use crate::storage::{Storage, StorageError};

/// Upper bound on a single media body read from the network.
pub const MAX_MEDIA_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("media unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Sticker,
    Document,
}

impl MediaKind {
    fn default_content_type(self) -> &'static str {
        match self {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
            MediaKind::Sticker => "image/webp",
            MediaKind::Document => "application/octet-stream",
        }
    }
}

/// How a client obtains the bytes of a media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MediaRef {
    /// Encrypted download through the transport, addressed by message.
    Direct {
        conversation_id: String,
        message_id: String,
    },
    /// Plaintext upstream URL, streamed through unmodified.
    Proxy { url: String },
}

/// Pick a fetch strategy for a media envelope. `None` when the envelope
/// carries neither usable key material nor an upstream location.
pub fn locate(kind: MediaKind, ctx: &ResolveContext<'_>, media: &MediaMessage) -> Option<MediaRef> {
    let url = media.url.as_deref().filter(|u| !u.is_empty());
    let direct_path = media.direct_path.as_deref().filter(|p| !p.is_empty());

    if ctx.is_broadcast_channel {
        let url = match (url, direct_path) {
            (Some(url), _) => url.to_string(),
            (None, Some(path)) => format!("{MEDIA_HOST}{path}"),
            (None, None) => {
                tracing::debug!(?kind, message_id = ctx.message_id, "channel media without url");
                return None;
            }
        };
        return Some(MediaRef::Proxy { url });
    }

    if ctx.message_id.is_empty() || (url.is_none() && direct_path.is_none()) {
        return None;
    }
    if !has_valid_media_key(media) {
        tracing::debug!(?kind, message_id = ctx.message_id, "media without usable key");
        return None;
    }
    Some(MediaRef::Direct {
        conversation_id: ctx.conversation_id.to_string(),
        message_id: ctx.message_id.to_string(),
    })
}

fn has_valid_media_key(media: &MediaMessage) -> bool {
    media
        .media_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(|k| base64::engine::general_purpose::STANDARD.decode(k).is_ok())
        .unwrap_or(false)
}

/// Content type for a media envelope: declared mimetype, then a guess from
/// the document file name, then a per-kind default.
pub fn content_type(kind: MediaKind, media: &MediaMessage) -> String {
    if let Some(mime) = media.mimetype.as_deref().filter(|m| !m.is_empty()) {
        return mime.to_string();
    }
    if kind == MediaKind::Document {
        if let Some(guess) = media
            .file_name
            .as_deref()
            .and_then(|name| mime_guess::from_path(name).first_raw())
        {
            return guess.to_string();
        }
    }
    kind.default_content_type().to_string()
}

/// Unwrap an envelope down to its media-bearing payload, if any.
pub fn find_media(payload: &MessagePayload) -> Option<(MediaKind, &MediaMessage)> {
    let mut current = payload;
    for _ in 0..=MAX_UNWRAP_DEPTH {
        current = match current {
            MessagePayload::Image(m) => return Some((MediaKind::Image, m)),
            MessagePayload::Video(m) => return Some((MediaKind::Video, m)),
            MessagePayload::Sticker(m) => return Some((MediaKind::Sticker, m)),
            MessagePayload::Document(m) => return Some((MediaKind::Document, m)),
            MessagePayload::Edited(w)
            | MessagePayload::ViewOnce(w)
            | MessagePayload::ViewOnceV2(w)
            | MessagePayload::ViewOnceV2Extension(w)
            | MessagePayload::Ephemeral(w) => w.inner.as_deref()?,
            MessagePayload::Protocol(p) => p.edited.as_deref()?,
            _ => return None,
        };
    }
    None
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Encryption material handed to the transport's download primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedMedia {
    pub kind: MediaKind,
    pub media_key: String,
    pub direct_path: Option<String>,
    pub url: Option<String>,
    pub mimetype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Encrypted(EncryptedMedia),
    Upstream(String),
}

/// A resolved media request, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFetch {
    pub source: MediaSource,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Network side of media retrieval. Errors are human-readable reasons.
pub trait MediaTransport: Send + Sync {
    fn download_encrypted(&self, media: &EncryptedMedia) -> Result<Vec<u8>, String>;
    fn fetch_upstream(&self, url: &str) -> Result<Vec<u8>, String>;
}

impl MediaFetch {
    pub fn execute(&self, transport: &dyn MediaTransport) -> Result<MediaBlob, MediaError> {
        let bytes = match &self.source {
            MediaSource::Encrypted(media) => transport.download_encrypted(media),
            MediaSource::Upstream(url) => transport.fetch_upstream(url),
        }
        .map_err(MediaError::Unavailable)?;
        Ok(MediaBlob {
            content_type: self.content_type.clone(),
            bytes,
        })
    }
}

/// Re-locate a stored message's media and describe how to fetch it.
pub fn plan_fetch(
    storage: &Storage,
    conversation_id: &str,
    message_id: &str,
) -> Result<MediaFetch, MediaError> {
    let record = storage
        .get_message(conversation_id, message_id)?
        .ok_or_else(|| MediaError::NotFound(format!("message {message_id}")))?;
    let payload = MessagePayload::decode(&record.payload);
    let (kind, media) = find_media(&payload)
        .ok_or_else(|| MediaError::NotFound(format!("media in message {message_id}")))?;

    let ctx = ResolveContext {
        conversation_id,
        message_id,
        is_broadcast_channel: ConversationKind::from_conversation_id(conversation_id)
            .is_broadcast_channel(),
    };
    let source = match locate(kind, &ctx, media) {
        Some(MediaRef::Proxy { url }) => MediaSource::Upstream(url),
        Some(MediaRef::Direct { .. }) => MediaSource::Encrypted(EncryptedMedia {
            kind,
            media_key: media.media_key.clone().unwrap_or_default(),
            direct_path: media.direct_path.clone(),
            url: media.url.clone(),
            mimetype: media.mimetype.clone(),
        }),
        None => {
            return Err(MediaError::Unavailable(
                "missing media key or upstream url".to_string(),
            ))
        }
    };

    Ok(MediaFetch {
        source,
        content_type: content_type(kind, media),
    })
}

/// Load, locate and download in one call.
pub fn fetch_media(
    storage: &Storage,
    transport: &dyn MediaTransport,
    conversation_id: &str,
    message_id: &str,
) -> Result<MediaBlob, MediaError> {
    plan_fetch(storage, conversation_id, message_id)?.execute(transport)
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// [`MediaTransport`] over HTTP: encrypted downloads go to the transport
/// bridge's `/media/download` endpoint, upstream URLs are fetched directly.
pub struct HttpMediaTransport {
    bridge_url: Option<String>,
}

impl HttpMediaTransport {
    pub fn new(bridge_url: Option<String>) -> Self {
        Self { bridge_url }
    }
}

impl MediaTransport for HttpMediaTransport {
    fn download_encrypted(&self, media: &EncryptedMedia) -> Result<Vec<u8>, String> {
        let base = self
            .bridge_url
            .as_deref()
            .ok_or_else(|| "no transport bridge configured".to_string())?;
        let url = format!("{}/media/download", base.trim_end_matches('/'));
        let body =
            serde_json::to_value(media).map_err(|e| format!("failed to serialize request: {e}"))?;
        let resp = ureq::post(&url)
            .send_json(body)
            .map_err(|e| format!("bridge download failed: {e}"))?;
        read_body(resp)
    }

    fn fetch_upstream(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = ureq::get(url)
            .call()
            .map_err(|e| format!("upstream fetch failed: {e}"))?;
        read_body(resp)
    }
}

fn read_body(resp: ureq::Response) -> Result<Vec<u8>, String> {
    let declared = resp
        .header("Content-Length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(len) = declared.filter(|len| *len > MAX_MEDIA_BYTES) {
        return Err(format!("media exceeds {MAX_MEDIA_BYTES} bytes ({len} declared)"));
    }

    let mut bytes = Vec::new();
    resp.into_reader()
        .take(MAX_MEDIA_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| format!("reading media body: {e}"))?;
    if bytes.len() as u64 > MAX_MEDIA_BYTES {
        return Err(format!("media exceeds {MAX_MEDIA_BYTES} bytes"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MessageRecord;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MediaTransport for FakeTransport {
        fn download_encrypted(&self, media: &EncryptedMedia) -> Result<Vec<u8>, String> {
            self.calls.lock().unwrap().push(format!("direct:{}", media.media_key));
            if self.fail {
                return Err("bridge down".to_string());
            }
            Ok(b"decrypted".to_vec())
        }

        fn fetch_upstream(&self, url: &str) -> Result<Vec<u8>, String> {
            self.calls.lock().unwrap().push(format!("proxy:{url}"));
            Ok(b"plain".to_vec())
        }
    }

    fn ctx(conversation_id: &'static str) -> ResolveContext<'static> {
        ResolveContext {
            conversation_id,
            message_id: "m1",
            is_broadcast_channel: ConversationKind::from_conversation_id(conversation_id)
                .is_broadcast_channel(),
        }
    }

    fn media(key: Option<&str>, url: Option<&str>, path: Option<&str>) -> MediaMessage {
        MediaMessage {
            media_key: key.map(String::from),
            url: url.map(String::from),
            direct_path: path.map(String::from),
            ..Default::default()
        }
    }

    fn store_with(conv: &str, id: &str, message: serde_json::Value) -> Storage {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_message(&MessageRecord::new(id, conv, 1, serde_json::to_vec(&message).unwrap()))
            .unwrap();
        storage
    }

    #[test]
    fn test_direct_strategy_needs_key() {
        let direct = locate(MediaKind::Image, &ctx("1@s.whatsapp.net"), &media(Some("a2V5"), None, Some("/p")));
        assert_eq!(
            direct,
            Some(MediaRef::Direct {
                conversation_id: "1@s.whatsapp.net".to_string(),
                message_id: "m1".to_string(),
            })
        );
        assert_eq!(
            locate(MediaKind::Image, &ctx("1@g.us"), &media(None, Some("https://x/y"), None)),
            None
        );
        assert_eq!(
            locate(MediaKind::Image, &ctx("1@g.us"), &media(Some("not base64!"), None, Some("/p"))),
            None
        );
    }

    #[test]
    fn test_channel_strategy_proxies_upstream() {
        let channel = ctx("120363@newsletter");
        assert_eq!(
            locate(MediaKind::Image, &channel, &media(None, Some("https://cdn/x.jpg"), Some("/p"))),
            Some(MediaRef::Proxy { url: "https://cdn/x.jpg".to_string() })
        );
        assert_eq!(
            locate(MediaKind::Sticker, &channel, &media(None, None, Some("/v/t62/s.webp"))),
            Some(MediaRef::Proxy {
                url: "https://mmg.whatsapp.net/v/t62/s.webp".to_string()
            })
        );
        assert_eq!(locate(MediaKind::Sticker, &channel, &media(Some("a2V5"), None, None)), None);
    }

    #[test]
    fn test_content_type_fallbacks() {
        let mut doc = media(None, None, None);
        assert_eq!(content_type(MediaKind::Sticker, &doc), "image/webp");
        doc.file_name = Some("report.pdf".to_string());
        assert_eq!(content_type(MediaKind::Document, &doc), "application/pdf");
        doc.mimetype = Some("text/plain".to_string());
        assert_eq!(content_type(MediaKind::Document, &doc), "text/plain");
    }

    #[test]
    fn test_fetch_direct_through_wrappers() {
        let storage = store_with(
            "1@s.whatsapp.net",
            "m1",
            json!({ "ephemeralMessage": { "message": { "videoMessage": {
                "mediaKey": "a2V5", "directPath": "/v/1", "mimetype": "video/mp4"
            }}}}),
        );
        let transport = FakeTransport::default();
        let blob = fetch_media(&storage, &transport, "1@s.whatsapp.net", "m1").unwrap();
        assert_eq!(blob.content_type, "video/mp4");
        assert_eq!(blob.bytes, b"decrypted");
        assert_eq!(*transport.calls.lock().unwrap(), vec!["direct:a2V5".to_string()]);
    }

    #[test]
    fn test_fetch_channel_proxies() {
        let storage = store_with(
            "9@newsletter",
            "m1",
            json!({ "imageMessage": { "url": "https://cdn/i.jpg" } }),
        );
        let transport = FakeTransport::default();
        let blob = fetch_media(&storage, &transport, "9@newsletter", "m1").unwrap();
        assert_eq!(blob.bytes, b"plain");
        assert_eq!(blob.content_type, "image/jpeg");
    }

    #[test]
    fn test_fetch_errors() {
        let storage = store_with("1@g.us", "text", json!({ "conversation": "no media" }));
        storage
            .upsert_message(&MessageRecord::new(
                "keyless",
                "1@g.us",
                2,
                serde_json::to_vec(&json!({ "imageMessage": { "directPath": "/p" } })).unwrap(),
            ))
            .unwrap();
        storage
            .upsert_message(&MessageRecord::new(
                "keyed",
                "1@g.us",
                3,
                serde_json::to_vec(&json!({ "imageMessage": { "mediaKey": "a2V5", "directPath": "/p" } }))
                    .unwrap(),
            ))
            .unwrap();
        let transport = FakeTransport {
            fail: true,
            ..Default::default()
        };

        assert!(matches!(
            fetch_media(&storage, &transport, "1@g.us", "missing"),
            Err(MediaError::NotFound(_))
        ));
        assert!(matches!(
            fetch_media(&storage, &transport, "2@g.us", "text"),
            Err(MediaError::NotFound(_))
        ));
        assert!(matches!(
            fetch_media(&storage, &transport, "1@g.us", "text"),
            Err(MediaError::NotFound(_))
        ));
        assert!(matches!(
            fetch_media(&storage, &transport, "1@g.us", "keyless"),
            Err(MediaError::Unavailable(_))
        ));
        assert!(matches!(
            fetch_media(&storage, &transport, "1@g.us", "keyed"),
            Err(MediaError::Unavailable(_))
        ));
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    /// Serve one HTTP response on a loopback port, streaming `body_len` zero
    /// bytes after `head`. Returns the URL to fetch.
    fn serve_once(head: String, body_len: usize) -> String {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(head.as_bytes());
            let chunk = vec![0u8; 1024 * 1024];
            let mut left = body_len;
            while left > 0 {
                let n = left.min(chunk.len());
                if stream.write_all(&chunk[..n]).is_err() {
                    return;
                }
                left -= n;
            }
        });
        format!("http://{addr}/blob")
    }

    #[test]
    fn test_upstream_body_over_cap_is_rejected() {
        let len = MAX_MEDIA_BYTES as usize + 1024;
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nConnection: close\r\n\r\n".to_string(),
            len,
        );
        let err = HttpMediaTransport::new(None).fetch_upstream(&url).unwrap_err();
        assert!(err.contains("exceeds"), "{err}");
    }

    #[test]
    fn test_declared_length_over_cap_is_rejected() {
        let len = MAX_MEDIA_BYTES + 1;
        let url = serve_once(
            format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n"),
            0,
        );
        let err = HttpMediaTransport::new(None).fetch_upstream(&url).unwrap_err();
        assert!(err.contains("declared"), "{err}");
    }

    #[test]
    fn test_upstream_body_within_cap_is_returned() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n".to_string(),
            5,
        );
        let bytes = HttpMediaTransport::new(None).fetch_upstream(&url).unwrap();
        assert_eq!(bytes, vec![0u8; 5]);
    }
}
