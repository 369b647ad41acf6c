// Chat collaborator
//
// The pipeline only needs to post and edit status lines, send photo albums and,
// when reply handling is switched on, read replies to its own status messages.
// `telegram` implements this over the Bot API.

pub mod telegram;

use async_trait::async_trait;
use std::fmt;

pub use telegram::TelegramClient;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A channel post that replies to an earlier message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub message_id: MessageId,
    pub reply_to: MessageId,
    pub text: String,
}

/// One page of inbound replies plus the offset to continue from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyBatch {
    pub next_offset: i64,
    pub replies: Vec<ChatReply>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a text message to the channel
    async fn send_message(&self, text: &str) -> Result<MessageId>;

    /// Replace the text of an earlier message
    async fn edit_message(&self, message: MessageId, text: &str) -> Result<()>;

    async fn delete_message(&self, message: MessageId) -> Result<()>;

    /// Send JPEG blobs as one grouped message; returns the ids of its parts
    async fn send_album(&self, photos: Vec<Vec<u8>>) -> Result<Vec<MessageId>>;

    /// Long-poll for replies posted after `offset`
    async fn poll_replies(&self, offset: i64) -> Result<ReplyBatch>;
}
