use super::traits::Channel;
use crate::config::InstanceConfig;
use async_trait::async_trait;
use rand::RngExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// WhatsApp sender — talks to the Evolution bridge API.
///
/// All endpoints share one convention: `POST {server}/<op>/{instance}` with
/// an `apikey` header and a JSON body carrying `number` plus op-specific
/// fields.
pub struct EvolutionSender {
    server_url: String,
    api_key: String,
    instance_name: String,
    enable_auto_split: bool,
    default_country_code: String,
    client: reqwest::Client,
}

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Presence refresh TTL sent to the bridge, in seconds.
const PRESENCE_TTL_SECS: u64 = 15;

impl EvolutionSender {
    pub fn for_instance(instance: &InstanceConfig) -> Self {
        Self {
            server_url: instance
                .evolution_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: instance.evolution_key.clone().unwrap_or_default(),
            instance_name: instance.evolution_instance().to_string(),
            enable_auto_split: instance.enable_auto_split,
            default_country_code: instance.default_country_code.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, op: &str) -> String {
        format!(
            "{}/{}/{}",
            self.server_url,
            op,
            urlencoding::encode(&self.instance_name)
        )
    }

    fn is_configured(&self) -> bool {
        let ok = !self.server_url.is_empty()
            && !self.api_key.is_empty()
            && !self.instance_name.is_empty();
        if !ok {
            tracing::error!("cannot send: missing Evolution server URL, api key, or instance name");
        }
        ok
    }

    async fn post(&self, op: &str, body: &Value) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(self.endpoint(op))
            .header("apikey", &self.api_key)
            .json(body)
            .timeout(SEND_TIMEOUT)
            .send()
            .await
    }

    /// Send a text reply with optional quoting, mentions, and splitting.
    ///
    /// Split priority: per-call override → instance `enable_auto_split` →
    /// default on. Only the first part carries the quote and mentions.
    pub async fn send_text_message(
        &self,
        recipient: &str,
        text: &str,
        quoted: Option<&Value>,
        mentioned: Option<Vec<String>>,
        mentions_everyone: bool,
        split_override: Option<bool>,
    ) -> bool {
        if !self.is_configured() {
            return false;
        }

        let mentioned = match mentioned {
            Some(m) => m,
            None => {
                let parsed = parse_mentions(text);
                if !parsed.is_empty() {
                    tracing::info!("auto-parsed {} mentions from reply text", parsed.len());
                }
                parsed
            }
        };

        if should_split(
            text,
            quoted.is_some_and(is_media_message),
            split_override,
            self.enable_auto_split,
        ) {
            self.send_split(recipient, text, quoted, &mentioned, mentions_everyone)
                .await
        } else {
            self.send_single(recipient, text, quoted, &mentioned, mentions_everyone)
                .await
        }
    }

    async fn send_split(
        &self,
        recipient: &str,
        text: &str,
        quoted: Option<&Value>,
        mentioned: &[String],
        mentions_everyone: bool,
    ) -> bool {
        let parts = split_parts(text);
        if parts.len() <= 1 {
            return self
                .send_single(recipient, text, quoted, mentioned, mentions_everyone)
                .await;
        }

        tracing::info!("splitting reply into {} parts", parts.len());
        let mut sent = 0usize;
        let count = parts.len();
        for (i, part) in parts.iter().enumerate() {
            // Quote and mentions only on the first part; repeating them on
            // every bubble reads as spam.
            let quote = if i == 0 { quoted } else { None };
            let mentions: &[String] = if i == 0 { mentioned } else { &[] };
            let everyone = i == 0 && mentions_everyone;

            if self
                .send_single(recipient, part, quote, mentions, everyone)
                .await
            {
                sent += 1;
            }

            if i < count - 1 {
                let delay = rand::rng().random_range(300..=1000);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        tracing::info!("split send result: {sent}/{count} parts delivered");
        sent == count
    }

    async fn send_single(
        &self,
        recipient: &str,
        text: &str,
        quoted: Option<&Value>,
        mentioned: &[String],
        mentions_everyone: bool,
    ) -> bool {
        let number = normalize_recipient(recipient, &self.default_country_code);

        let mut payload = json!({ "number": number, "text": text });
        if !mentioned.is_empty() {
            payload["mentioned"] = json!(mentioned);
        }
        if mentions_everyone {
            payload["mentionsEveryOne"] = json!(true);
        }
        // Quoted payloads stay off the wire: the bridge rejects them with
        // schema errors. The quote still matters for split suppression and
        // the 400 classification below.

        let response = match self.post("message/sendText", &payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("failed to send message to {number}: {e}");
                return false;
            }
        };

        let status = response.status();
        if status.as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            return classify_400(quoted.is_some(), !mentioned.is_empty(), &body);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                "bridge send to {number} failed ({status}): {}",
                crate::util::truncate_with_ellipsis(&body, 200)
            );
            return false;
        }

        tracing::info!("message sent to {number}");
        true
    }

    /// Send a media message (image, video, document).
    pub async fn send_media(
        &self,
        recipient: &str,
        media_type: &str,
        media: &str,
        mime_type: &str,
        caption: Option<&str>,
        filename: Option<&str>,
    ) -> bool {
        if !self.is_configured() {
            return false;
        }
        let mut payload = json!({
            "number": normalize_recipient(recipient, &self.default_country_code),
            "mediatype": media_type,
            "media": media,
            "mimetype": mime_type,
        });
        if let Some(caption) = caption {
            payload["caption"] = json!(caption);
        }
        if let Some(filename) = filename {
            payload["fileName"] = json!(filename);
        }
        self.post_ok("message/sendMedia", &payload).await
    }

    /// Send a WhatsApp voice-note style audio message.
    pub async fn send_audio(&self, recipient: &str, audio: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let payload = json!({
            "number": normalize_recipient(recipient, &self.default_country_code),
            "audio": audio,
        });
        self.post_ok("message/sendWhatsAppAudio", &payload).await
    }

    pub async fn send_sticker(&self, recipient: &str, sticker: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let payload = json!({
            "number": normalize_recipient(recipient, &self.default_country_code),
            "sticker": sticker,
        });
        self.post_ok("message/sendSticker", &payload).await
    }

    pub async fn send_contacts(&self, recipient: &str, contacts: &[Value]) -> bool {
        if !self.is_configured() {
            return false;
        }
        let payload = json!({
            "number": normalize_recipient(recipient, &self.default_country_code),
            "contact": contacts,
        });
        self.post_ok("message/sendContact", &payload).await
    }

    /// React to a message by id.
    pub async fn send_reaction(&self, remote_jid: &str, message_id: &str, reaction: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let payload = json!({
            "key": { "remoteJid": remote_jid, "fromMe": false, "id": message_id },
            "reaction": reaction,
        });
        self.post_ok("message/sendReaction", &payload).await
    }

    /// Fetch a user's WhatsApp profile.
    pub async fn fetch_profile(&self, phone_number: &str) -> Option<Value> {
        if !self.is_configured() {
            return None;
        }
        let payload = json!({
            "number": normalize_recipient(phone_number, &self.default_country_code),
        });
        let response = self.post("chat/fetchProfile", &payload).await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Send a presence update ("composing", "paused", ...) with a TTL.
    pub async fn send_presence(&self, recipient: &str, presence: &str, ttl_secs: u64) -> bool {
        if !self.is_configured() {
            return false;
        }
        let payload = json!({
            "number": normalize_recipient(recipient, &self.default_country_code),
            "presence": presence,
            "delay": ttl_secs * 1000,
        });
        match self.post("chat/sendPresence", &payload).await {
            Ok(response) => matches!(response.status().as_u16(), 200..=202),
            Err(e) => {
                tracing::debug!("presence update failed: {e}");
                false
            }
        }
    }

    async fn post_ok(&self, op: &str, payload: &Value) -> bool {
        match self.post(op, payload).await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::error!("{op} failed with status {}", response.status());
                false
            }
            Err(e) => {
                tracing::error!("{op} failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl Channel for EvolutionSender {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_text(&self, recipient: &str, text: &str) -> bool {
        self.send_text_message(recipient, text, None, None, false, None)
            .await
    }

    async fn start_typing(&self, recipient: &str) {
        self.send_presence(recipient, "composing", PRESENCE_TTL_SECS)
            .await;
    }

    async fn stop_typing(&self, recipient: &str) {
        self.send_presence(recipient, "paused", 1).await;
    }
}

/// Classify a 400 send response.
///
/// The bridge has a known defect: sends that carry a quote or mentions can
/// deliver successfully and still return HTTP 400 with a database-schema
/// error body. Failing those re-triggers user-visible retries for messages
/// that already arrived, so they are classified as success and logged for
/// audit. A bare 400 is a genuine failure. This heuristic is confined to
/// this function and must not grow to other status codes.
fn classify_400(had_quote: bool, had_mentions: bool, body: &str) -> bool {
    if had_quote || had_mentions {
        tracing::warn!(
            "bridge returned 400 on a send with quote/mentions; treating as delivered \
             (body: {})",
            crate::util::truncate_with_ellipsis(body, 200)
        );
        true
    } else {
        tracing::error!(
            "bridge returned 400 without quote or mentions — genuine failure (body: {})",
            crate::util::truncate_with_ellipsis(body, 200)
        );
        false
    }
}

/// Normalize a recipient for the bridge: strip the JID suffix and leading
/// `+`, collapse to digits, and prepend the default country code when the
/// number is short enough to be ambiguous.
pub fn normalize_recipient(recipient: &str, default_country_code: &str) -> String {
    let bare = recipient.split('@').next().unwrap_or(recipient);
    let bare = bare.strip_prefix('+').unwrap_or(bare);
    let digits: String = bare.chars().filter(char::is_ascii_digit).collect();

    if digits.len() <= 11 && !digits.starts_with(default_country_code) {
        format!("{default_country_code}{digits}")
    } else {
        digits
    }
}

/// Pull `@<digits>` mentions out of reply text as WhatsApp JIDs.
pub fn parse_mentions(text: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            // Anything shorter than 8 digits is a handle, not a phone.
            if end - start >= 8 {
                mentions.push(format!("{}@s.whatsapp.net", &text[start..end]));
            }
            i = end;
        } else {
            i += 1;
        }
    }
    mentions
}

/// Splitting decision. Priority: per-call override → instance config →
/// default on. Never split a reply to a media message, and only split when
/// the text actually contains a blank line.
pub fn should_split(
    text: &str,
    quoted_is_media: bool,
    split_override: Option<bool>,
    enable_auto_split: bool,
) -> bool {
    let enabled = split_override.unwrap_or(enable_auto_split);
    enabled && !quoted_is_media && text.contains("\n\n")
}

/// Split on blank lines, trimming parts and dropping empties.
pub fn split_parts(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Whether a quoted webhook message is media (its `message` object carries a
/// media key).
pub fn is_media_message(quoted: &Value) -> bool {
    let Some(message) = quoted.get("message") else {
        return false;
    };
    [
        "imageMessage",
        "videoMessage",
        "audioMessage",
        "documentMessage",
        "stickerMessage",
    ]
    .iter()
    .any(|key| message.get(*key).is_some())
}

/// Background typing-indicator loop for one outbound reply.
///
/// Refreshes `composing` until stopped. After `mark_sent` the indicator is
/// held for a short cooldown, then cleared, so it never vanishes the instant
/// the reply lands. `stop` is idempotent and safe to call from cleanup paths.
pub struct PresenceUpdater {
    sender: Arc<EvolutionSender>,
    recipient: String,
    cancel: CancellationToken,
    message_sent: Arc<AtomicBool>,
}

const POST_SEND_COOLDOWN: Duration = Duration::from_millis(1000);

impl PresenceUpdater {
    /// Spawn the refresh loop and return the handle controlling it.
    pub fn start(sender: Arc<EvolutionSender>, recipient: &str) -> Self {
        let updater = Self {
            sender: sender.clone(),
            recipient: recipient.to_string(),
            cancel: CancellationToken::new(),
            message_sent: Arc::new(AtomicBool::new(false)),
        };

        let cancel = updater.cancel.clone();
        let message_sent = updater.message_sent.clone();
        let recipient = updater.recipient.clone();
        tokio::spawn(async move {
            // Short grace period so one-shot failures don't flash a typing
            // indicator at all.
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(500)) => {}
            }

            loop {
                sender
                    .send_presence(&recipient, "composing", PRESENCE_TTL_SECS)
                    .await;

                if message_sent.load(Ordering::Relaxed) {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(POST_SEND_COOLDOWN) => {}
                    }
                    break;
                }

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }

            sender.send_presence(&recipient, "paused", 1).await;
        });

        updater
    }

    /// The reply was delivered; keep typing briefly, then clear.
    pub fn mark_sent(&self) {
        self.message_sent.store(true, Ordering::Relaxed);
    }

    /// Stop immediately and clear the indicator. Idempotent.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.sender.send_presence(&self.recipient, "paused", 1).await;
    }
}
