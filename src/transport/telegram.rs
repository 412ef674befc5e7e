use anyhow::{anyhow, Result};
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::dispatch::{DeliveryError, Notification, NotificationSink};

/// Telegram caps photo captions at 1024 characters.
const CAPTION_LIMIT: usize = 1024;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API sink: `sendMessage` for text-only alerts, `sendPhoto` when the
/// alert carries a snapshot.
pub struct TelegramNotifier {
    api_base: String,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, api_base: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() || bot_token.contains('/') {
            return Err(anyhow!("telegram bot token is empty or malformed"));
        }
        let api_base = api_base.trim_end_matches('/');
        if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
            return Err(anyhow!("telegram api base must be an http(s) url"));
        }
        Ok(Self {
            api_base: api_base.to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }
}

impl NotificationSink for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn deliver(&self, notification: &Notification, timeout: Duration) -> Result<(), DeliveryError> {
        let chat_id = notification.destination.trim();
        if !is_valid_chat_id(chat_id) {
            return Err(DeliveryError::Permanent(format!(
                "malformed telegram chat id '{}'",
                chat_id
            )));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let response = match &notification.image {
            Some(jpeg) => {
                let boundary = multipart_boundary();
                let body = photo_body(&boundary, chat_id, &notification.text, jpeg);
                agent
                    .post(&self.method_url("sendPhoto"))
                    .set(
                        "Content-Type",
                        &format!("multipart/form-data; boundary={}", boundary),
                    )
                    .send_bytes(&body)
            }
            None => agent
                .post(&self.method_url("sendMessage"))
                .send_form(&[("chat_id", chat_id), ("text", notification.text.as_str())]),
        };
        match response {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                Err(classify_status(code, &detail))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(DeliveryError::Retryable(format!("transport: {}", err)))
            }
        }
    }
}

/// Numeric chat ids (negative for groups) or `@channelname`.
pub fn is_valid_chat_id(chat_id: &str) -> bool {
    static CHAT_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = CHAT_ID_RE.get_or_init(|| {
        Regex::new(r"^(-?[0-9]{1,20}|@[A-Za-z][A-Za-z0-9_]{4,31})$").expect("chat id regex")
    });
    re.is_match(chat_id)
}

pub fn classify_status(code: u16, detail: &str) -> DeliveryError {
    let detail = detail.chars().take(200).collect::<String>();
    match code {
        429 | 500..=599 => DeliveryError::Retryable(format!("http {}: {}", code, detail)),
        _ => DeliveryError::Permanent(format!("http {}: {}", code, detail)),
    }
}

fn multipart_boundary() -> String {
    let token: u64 = rand::thread_rng().gen();
    format!("ppewatch{:016x}", token)
}

fn photo_body(boundary: &str, chat_id: &str, caption: &str, jpeg: &[u8]) -> Vec<u8> {
    let caption: String = caption.chars().take(CAPTION_LIMIT).collect();
    let mut body = Vec::with_capacity(jpeg.len() + caption.len() + 512);
    for (name, value) in [("chat_id", chat_id), ("caption", caption.as_str())] {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"violation.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
