//! Inbound WhatsApp webhook payload handling.
//!
//! The Evolution bridge ships several payload shapes (raw events, base64
//! wrapped bodies, single messages, message arrays). Everything here
//! flattens them into uniform per-message values, extracts the pieces the
//! router cares about, and runs one message through the full pipeline.

use crate::agent::NormalizedReply;
use crate::channels::whatsapp::{EvolutionSender, PresenceUpdater};
use crate::config::{ChannelKind, InstanceConfig};
use crate::router::{InboundMessage, MessageRouter};
use crate::trace::{self, TraceContext, TraceFields, TraceService, TraceStatus};
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Unwrap a possibly base64-wrapped webhook body.
///
/// With "Webhook Base64" enabled the bridge sends `{"data": "<base64 of
/// JSON>"}`. Decode failures fall back to the raw body — the wrapped and
/// unwrapped forms must normalize identically.
pub fn decode_webhook_body(raw: &Value) -> Value {
    let Some(encoded) = raw.get("data").and_then(Value::as_str) else {
        return raw.clone();
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());

    match decoded {
        Some(value) => {
            tracing::debug!("decoded base64-wrapped webhook payload");
            value
        }
        None => {
            tracing::warn!("could not decode base64 webhook payload, using raw body");
            raw.clone()
        }
    }
}

/// Flatten a decoded webhook body into individual message events.
///
/// Shapes: `{"data": {"messages": [...]}}`, `{"data": {"message": {...}}}`
/// (the data object is the event), or the whole body as one event.
pub fn extract_messages(body: &Value) -> Vec<Value> {
    if let Some(data) = body.get("data").filter(|d| d.is_object()) {
        if let Some(messages) = data.get("messages").and_then(Value::as_array) {
            return messages.clone();
        }
        return vec![data.clone()];
    }
    vec![body.clone()]
}

/// Message type, preferring the bridge's own `messageType` field over
/// sniffing the message object.
pub fn extract_message_type(event: &Value) -> String {
    if let Some(message_type) = event.get("messageType").and_then(Value::as_str) {
        return match message_type {
            "pttMessage" => "ptt".into(),
            "voiceMessage" => "voice".into(),
            "audioMessage" => "audio".into(),
            other => other.to_string(),
        };
    }

    let Some(message) = event.get("message").filter(|m| m.is_object()) else {
        return String::new();
    };

    for (key, name) in [
        ("conversation", "text"),
        ("extendedTextMessage", "text"),
        ("audioMessage", "audio"),
        ("pttMessage", "ptt"),
        ("voiceMessage", "voice"),
        ("imageMessage", "image"),
        ("videoMessage", "video"),
        ("documentMessage", "document"),
        ("stickerMessage", "sticker"),
        ("contactMessage", "contact"),
        ("locationMessage", "location"),
    ] {
        if message.get(key).is_some() {
            return name.to_string();
        }
    }
    "unknown".into()
}

fn is_text_type(message_type: &str) -> bool {
    matches!(message_type, "text" | "conversation" | "extendedTextMessage")
}

fn is_audio_type(message_type: &str) -> bool {
    matches!(message_type, "audioMessage" | "audio" | "voice" | "ptt")
}

fn is_media_type(message_type: &str) -> bool {
    is_audio_type(message_type)
        || matches!(
            message_type,
            "imageMessage" | "image" | "videoMessage" | "video" | "documentMessage" | "document"
        )
}

/// Whether the pipeline handles this message at all (text, audio, media).
pub fn is_processable(message_type: &str) -> bool {
    is_text_type(message_type) || is_media_type(message_type)
}

/// The agent-facing message type parameter.
fn agent_message_type(message_type: &str) -> &'static str {
    match message_type {
        t if is_audio_type(t) => "audio",
        "imageMessage" | "image" => "image",
        "videoMessage" | "video" => "video",
        "documentMessage" | "document" => "document",
        t if is_text_type(t) => "text",
        _ => "media",
    }
}

/// Extract the text content of a message event.
pub fn extract_content(event: &Value) -> String {
    let message = event.get("message").cloned().unwrap_or_default();

    let from_obj = [
        ("conversation", None),
        ("extendedTextMessage", Some("text")),
        ("buttonsResponseMessage", Some("selectedDisplayText")),
        ("listResponseMessage", Some("title")),
        ("imageMessage", Some("caption")),
        ("videoMessage", Some("caption")),
        ("documentMessage", Some("caption")),
    ]
    .iter()
    .find_map(|(key, inner)| {
        let node = message.get(*key)?;
        match inner {
            None => node.as_str().map(ToString::to_string),
            Some(inner) => node.get(*inner).and_then(Value::as_str).map(ToString::to_string),
        }
    });

    if let Some(text) = from_obj {
        return text;
    }

    if let Some(body) = event.get("body").and_then(Value::as_str) {
        return body.to_string();
    }

    // Audio without a caption still needs non-empty content, or session
    // creation misbehaves downstream.
    if is_audio_type(&extract_message_type(event)) {
        return "[Audio message - transcription will be handled by agent]".into();
    }

    String::new()
}

/// Extract the quoted message's text, when this event replies to something.
pub fn extract_quoted_text(event: &Value) -> Option<String> {
    let quoted = event
        .get("contextInfo")
        .and_then(|c| c.get("quotedMessage"))
        .or_else(|| {
            event
                .get("message")
                .and_then(|m| m.get("contextInfo"))
                .and_then(|c| c.get("quotedMessage"))
        })?;

    let text = if let Some(text) = quoted.get("conversation").and_then(Value::as_str) {
        text.to_string()
    } else if let Some(text) = quoted
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        text.to_string()
    } else if let Some(image) = quoted.get("imageMessage") {
        image
            .get("caption")
            .and_then(Value::as_str)
            .unwrap_or("[Image]")
            .to_string()
    } else if let Some(video) = quoted.get("videoMessage") {
        video
            .get("caption")
            .and_then(Value::as_str)
            .unwrap_or("[Video]")
            .to_string()
    } else if let Some(document) = quoted.get("documentMessage") {
        document
            .get("caption")
            .and_then(Value::as_str)
            .unwrap_or("[Document]")
            .to_string()
    } else if quoted.get("audioMessage").is_some() {
        "[Audio Message]".to_string()
    } else {
        return None;
    };

    (!text.is_empty()).then_some(text)
}

/// Build the agent media payload for a media event.
///
/// Inline base64 is preferred over a URL reference: the bridge uploads
/// assets asynchronously, and a URL can 404 while the upload is still in
/// flight. Base64 locations vary by bridge version, so several are probed.
pub fn extract_media_contents(event: &Value, content: &str, message_type: &str) -> Option<Vec<Value>> {
    if !is_media_type(message_type) {
        return None;
    }

    let message = event.get("message").cloned().unwrap_or_default();

    let media_keys = [
        "imageMessage",
        "videoMessage",
        "documentMessage",
        "audioMessage",
    ];
    let media_meta = media_keys
        .iter()
        .find_map(|key| message.get(*key))
        .cloned()
        .unwrap_or_default();

    let base64_data = message
        .get("base64")
        .and_then(Value::as_str)
        .or_else(|| event.get("base64").and_then(Value::as_str))
        .or_else(|| {
            media_keys
                .iter()
                .find_map(|key| message.get(*key).and_then(|m| m.get("base64")))
                .and_then(Value::as_str)
        });

    let media_url = message
        .get("mediaUrl")
        .and_then(Value::as_str)
        .or_else(|| event.get("mediaUrl").and_then(Value::as_str))
        .or_else(|| {
            media_keys
                .iter()
                .find_map(|key| message.get(*key).and_then(|m| m.get("url")))
                .and_then(Value::as_str)
        });

    let mime_type = media_meta
        .get("mimetype")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream");

    let mut item = json!({
        "alt_text": if content.is_empty() { message_type } else { content },
        "mime_type": mime_type,
    });

    if let Some(data) = base64_data {
        item["data"] = json!(data);
    } else if let Some(url) = media_url {
        tracing::warn!("no inline media data available, falling back to URL reference");
        item["media_url"] = json!(url);
    } else {
        return None;
    }

    if message.get("imageMessage").is_some() || message.get("videoMessage").is_some() {
        item["width"] = media_meta.get("width").cloned().unwrap_or(json!(0));
        item["height"] = media_meta.get("height").cloned().unwrap_or(json!(0));
    } else if message.get("documentMessage").is_some() {
        item["name"] = media_meta
            .get("fileName")
            .cloned()
            .unwrap_or(json!("document"));
        item["size_bytes"] = media_meta.get("fileLength").cloned().unwrap_or(json!(0));
    } else if message.get("audioMessage").is_some() {
        item["duration"] = media_meta.get("seconds").cloned().unwrap_or(json!(0));
        item["size_bytes"] = media_meta.get("fileLength").cloned().unwrap_or(json!(0));
    }

    Some(vec![item])
}

/// Run one WhatsApp message event through the full pipeline: trace, route,
/// deliver, finalize.
pub async fn process_whatsapp_message(
    event: Value,
    instance: &InstanceConfig,
    router: &Arc<MessageRouter>,
    traces: &Arc<TraceService>,
) -> Option<String> {
    let trace = traces.create_trace(&event, &instance.name);
    let trace_id = trace.as_ref().map(|t| t.trace_id().to_string());
    if let Some(trace) = &trace {
        trace.update_status(TraceStatus::Processing, TraceFields::default());
    }

    let sender_jid = event
        .get("key")
        .and_then(|k| k.get("remoteJid"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if sender_jid.is_empty() {
        tracing::error!("no sender id in message, unable to process");
        if let Some(trace) = &trace {
            trace.fail("webhook_received", "missing key.remoteJid");
        }
        return trace_id;
    }

    let message_type = extract_message_type(&event);
    if !is_processable(&message_type) {
        tracing::info!("ignoring message of type '{message_type}'");
        if let Some(trace) = &trace {
            trace.update_status(TraceStatus::Completed, TraceFields::default());
        }
        return trace_id;
    }

    let phone = crate::channels::whatsapp::normalize_recipient(
        trace::extract_phone(sender_jid),
        &instance.default_country_code,
    );
    let display_name = event
        .get("pushName")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(ToString::to_string);
    let content = extract_content(&event);
    let session_name = format!("{}_{phone}", instance.name);

    let inbound = InboundMessage {
        channel: Some(ChannelKind::Whatsapp),
        sender_id: sender_jid.to_string(),
        external_id: phone,
        display_name,
        text: content.clone(),
        message_type: agent_message_type(&message_type).to_string(),
        media_contents: extract_media_contents(&event, &content, &message_type),
        quoted_text: extract_quoted_text(&event),
        session_name,
    };

    let evolution = Arc::new(EvolutionSender::for_instance(instance));
    let presence = PresenceUpdater::start(evolution.clone(), sender_jid);

    let reply = router.route(&inbound, instance, trace.as_ref()).await;
    deliver_whatsapp_reply(&evolution, sender_jid, &event, &reply, trace.as_ref()).await;

    presence.mark_sent();
    presence.stop().await;

    trace_id
}

/// Deliver a routed reply back through the bridge, honoring pre-chunked
/// streaming parts when the backend supplied them.
async fn deliver_whatsapp_reply(
    evolution: &Arc<EvolutionSender>,
    recipient: &str,
    original_event: &Value,
    reply: &NormalizedReply,
    trace: Option<&TraceContext>,
) {
    if !reply.should_deliver() {
        if reply.suppressed {
            tracing::warn!("reply suppressed, nothing delivered");
        }
        if let Some(trace) = trace {
            trace.update_status(TraceStatus::Completed, TraceFields::default());
        }
        return;
    }

    let success = match &reply.streaming_chunks {
        Some(chunks) if !chunks.is_empty() => {
            tracing::info!("sending {} pre-chunked parts progressively", chunks.len());
            let mut all_ok = true;
            for (i, chunk) in chunks.iter().enumerate() {
                // Only the first part quotes the inbound message.
                let quoted = (i == 0).then_some(original_event);
                let ok = evolution
                    .send_text_message(recipient, chunk, quoted, None, false, None)
                    .await;
                all_ok &= ok;
                if i < chunks.len() - 1 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            all_ok
        }
        _ => {
            evolution
                .send_text_message(recipient, &reply.text, Some(original_event), None, false, None)
                .await
        }
    };

    if let Some(trace) = trace {
        trace.log_channel_send(
            "evolution",
            &json!({
                "recipient": recipient,
                "message_text": reply.text,
                "has_quoted_message": true,
            }),
            if success { 201 } else { 400 },
            success,
        );
    }
}
