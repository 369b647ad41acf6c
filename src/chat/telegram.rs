use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::{ChatClient, ChatReply, MessageId, ReplyBatch};
use crate::config::{ChatConfig, MAX_SCREENSHOTS};
use crate::error::{Result, ReelgateError};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
    reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    channel_post: Option<Message>,
}

/// Telegram Bot API client bound to one channel
pub struct TelegramClient {
    client: Client,
    base_url: String,
    channel_id: i64,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &ChatConfig, token: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent("reelgate/0.1.0")
            // leave room for a full long poll
            .timeout(Duration::from_secs(config.poll_timeout_secs + 60))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", config.api_url.trim_end_matches('/'), token),
            channel_id: config.channel_id,
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    /// Build a client from the token in `config.token_env` and verify it.
    pub async fn connect(config: &ChatConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            ReelgateError::Startup(format!("bot token variable {} is not set", config.token_env))
        })?;

        if config.channel_id == 0 {
            return Err(ReelgateError::Startup("chat.channel_id is not configured".to_string()));
        }

        let client = Self::new(config, &token)?;
        let me: User = client
            .call("getMe", &json!({}))
            .await
            .map_err(|e| ReelgateError::Startup(format!("chat authentication failed: {}", e)))?;

        info!(
            "Authenticated with chat API as @{}",
            me.username.as_deref().unwrap_or("unknown")
        );
        Ok(client)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        debug!("Chat API call: {}", method);

        let response = self.client
            .post(format!("{}/{}", self.base_url, method))
            .json(body)
            .send()
            .await?;

        Self::unwrap_response(method, response).await
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T> {
        debug!("Chat API upload: {}", method);

        let response = self.client
            .post(format!("{}/{}", self.base_url, method))
            .multipart(form)
            .send()
            .await?;

        Self::unwrap_response(method, response).await
    }

    async fn unwrap_response<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;
        parse_api_response(method, status.as_u16(), &text)
    }

    fn photo_part(index: usize, jpeg: Vec<u8>) -> Result<Part> {
        Part::bytes(jpeg)
            .file_name(format!("screenshot{}.jpg", index + 1))
            .mime_str("image/jpeg")
            .map_err(ReelgateError::Http)
    }

    async fn send_photo(&self, jpeg: Vec<u8>) -> Result<MessageId> {
        let form = Form::new()
            .text("chat_id", self.channel_id.to_string())
            .part("photo", Self::photo_part(0, jpeg)?);

        let message: Message = self.call_multipart("sendPhoto", form).await?;
        Ok(MessageId(message.message_id))
    }

    async fn send_media_group(&self, photos: Vec<Vec<u8>>) -> Result<Vec<MessageId>> {
        let mut form = Form::new()
            .text("chat_id", self.channel_id.to_string())
            .text("media", media_group_payload(photos.len()).to_string());

        for (index, jpeg) in photos.into_iter().enumerate() {
            form = form.part(format!("photo{}", index), Self::photo_part(index, jpeg)?);
        }

        let messages: Vec<Message> = self.call_multipart("sendMediaGroup", form).await?;
        Ok(messages.into_iter().map(|m| MessageId(m.message_id)).collect())
    }
}

fn parse_api_response<T: DeserializeOwned>(method: &str, status: u16, body: &str) -> Result<T> {
    let parsed: ApiResponse<T> = serde_json::from_str(body).map_err(|e| {
        ReelgateError::Chat(format!("{} returned HTTP {} with unreadable body: {}", method, status, e))
    })?;

    if !parsed.ok {
        return Err(ReelgateError::Chat(format!(
            "{} failed: {}",
            method,
            parsed.description.unwrap_or_else(|| format!("HTTP {}", status))
        )));
    }

    parsed
        .result
        .ok_or_else(|| ReelgateError::Chat(format!("{} returned no result", method)))
}

/// `media` field of sendMediaGroup, referencing parts `photo0..photoN`.
fn media_group_payload(count: usize) -> Value {
    Value::Array(
        (0..count)
            .map(|i| json!({ "type": "photo", "media": format!("attach://photo{}", i) }))
            .collect(),
    )
}

/// Replies to earlier posts in `channel_id`, plus the next update offset.
fn collect_replies(updates: Vec<Update>, channel_id: i64, offset: i64) -> ReplyBatch {
    let next_offset = updates
        .iter()
        .map(|u| u.update_id + 1)
        .max()
        .unwrap_or(offset);

    let replies = updates
        .into_iter()
        .filter_map(|u| u.channel_post)
        .filter(|post| post.chat.id == channel_id)
        .filter_map(|post| {
            let reply_to = post.reply_to_message.as_ref()?.message_id;
            Some(ChatReply {
                message_id: MessageId(post.message_id),
                reply_to: MessageId(reply_to),
                text: post.text?,
            })
        })
        .collect();

    ReplyBatch { next_offset, replies }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_message(&self, text: &str) -> Result<MessageId> {
        let message: Message = self
            .call("sendMessage", &json!({ "chat_id": self.channel_id, "text": text }))
            .await?;
        Ok(MessageId(message.message_id))
    }

    async fn edit_message(&self, message: MessageId, text: &str) -> Result<()> {
        // result is the edited Message, or `true` for inline messages
        let _: Value = self
            .call(
                "editMessageText",
                &json!({ "chat_id": self.channel_id, "message_id": message.0, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message: MessageId) -> Result<()> {
        let _: bool = self
            .call("deleteMessage", &json!({ "chat_id": self.channel_id, "message_id": message.0 }))
            .await?;
        Ok(())
    }

    async fn send_album(&self, photos: Vec<Vec<u8>>) -> Result<Vec<MessageId>> {
        match photos.len() {
            0 => Ok(Vec::new()),
            // media groups need at least two items
            1 => {
                let jpeg = photos.into_iter().next().unwrap_or_default();
                Ok(vec![self.send_photo(jpeg).await?])
            }
            n if n <= MAX_SCREENSHOTS => self.send_media_group(photos).await,
            n => Err(ReelgateError::Chat(format!(
                "album of {} photos exceeds the {} photo limit",
                n, MAX_SCREENSHOTS
            ))),
        }
    }

    async fn poll_replies(&self, offset: i64) -> Result<ReplyBatch> {
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                &json!({
                    "offset": offset,
                    "timeout": self.poll_timeout_secs,
                    "allowed_updates": ["channel_post"],
                }),
            )
            .await?;

        Ok(collect_replies(updates, self.channel_id, offset))
    }
}
