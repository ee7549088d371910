//! Support chat on top of the access layer.
//!
//! Messages of a session live in their own collection `chat_<session>`; the
//! `sessions` collection holds one summary document per session (last message,
//! unread count, block flag). Every operation goes through [`StoreClient`]
//! verbs, so chat writes share the write queue with everything else.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::client::StoreClient;
use crate::document::{now_ms, Record};
use crate::error::StoreResult;
use crate::fanout::Subscription;
use crate::ratelimit::RateLimiter;
use crate::rules::collections::{CHAT_PREFIX, SESSIONS};

/// Collection holding the messages of `session_id`.
pub fn chat_collection(session_id: &str) -> String {
    format!("{CHAT_PREFIX}{session_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Photo => write!(f, "photo"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Document => write!(f, "document"),
        }
    }
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_message_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub last_message: String,
    pub last_message_time: u64,
    pub unread_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
}

/// Chat operations for the storefront and the admin panel.
pub struct ChatService {
    client: Arc<StoreClient>,
    limiter: RateLimiter,
}

impl ChatService {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self::with_limiter(client, RateLimiter::default())
    }

    pub fn with_limiter(client: Arc<StoreClient>, limiter: RateLimiter) -> Self {
        Self { client, limiter }
    }

    /// Store a message and refresh the session summary.
    ///
    /// User messages are rate limited and bump the unread count; admin
    /// messages reset it.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        sender: Sender,
        attachment: Option<Attachment>,
    ) -> StoreResult<ChatMessage> {
        if sender == Sender::User {
            self.limiter.check(session_id).await?;
        }

        let now = now_ms();
        let message = ChatMessage {
            id: message_id(now),
            text: text.to_string(),
            sender,
            timestamp: now,
            read: false,
            media_url: attachment.as_ref().map(|a| a.url.clone()),
            media_type: attachment.as_ref().map(|a| a.kind),
            telegram_message_id: None,
        };
        self.client
            .set_document(&chat_collection(session_id), serde_json::to_value(&message)?)
            .await?;

        let current = self.session(session_id).await?.unwrap_or_default();
        let unread_count = match sender {
            Sender::User => current.unread_count + 1,
            Sender::Admin => 0,
        };
        let user_name = if current.user_name.is_empty() {
            format!("User {}", session_id.chars().take(4).collect::<String>())
        } else {
            current.user_name
        };
        let last_message = match (text.is_empty(), message.media_type) {
            (false, _) => text.to_string(),
            (true, Some(kind)) => format!("[{kind}]"),
            (true, None) => "...".to_string(),
        };

        let summary = ChatSession {
            id: session_id.to_string(),
            user_id: session_id.to_string(),
            user_name,
            last_message,
            last_message_time: now_ms(),
            unread_count,
            blocked: current.blocked,
        };
        self.client
            .set_document(SESSIONS, serde_json::to_value(&summary)?)
            .await?;

        Ok(message)
    }

    pub async fn edit_message(&self, session_id: &str, message_id: &str, text: &str) -> StoreResult<()> {
        self.client
            .set_document(
                &chat_collection(session_id),
                json!({ "id": message_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    /// Link a stored message to its copy in the Telegram chat.
    pub async fn set_telegram_message_id(
        &self,
        session_id: &str,
        message_id: &str,
        telegram_id: i64,
    ) -> StoreResult<()> {
        self.client
            .set_document(
                &chat_collection(session_id),
                json!({ "id": message_id, "telegramMessageId": telegram_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        self.client
            .delete_document(&chat_collection(session_id), message_id)
            .await
    }

    pub async fn mark_session_read(&self, session_id: &str) -> StoreResult<()> {
        self.client
            .set_document(SESSIONS, json!({ "id": session_id, "unreadCount": 0 }))
            .await?;
        Ok(())
    }

    /// Flip the session's block flag and return the new value.
    pub async fn toggle_session_block(&self, session_id: &str) -> StoreResult<bool> {
        let blocked = !self
            .session(session_id)
            .await?
            .and_then(|s| s.blocked)
            .unwrap_or(false);
        self.client
            .set_document(SESSIONS, json!({ "id": session_id, "blocked": blocked }))
            .await?;
        Ok(blocked)
    }

    /// Remove the session summary and every message of the session.
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        self.client.delete_document(SESSIONS, session_id).await?;

        let collection = chat_collection(session_id);
        let messages = self.client.get_collection(&collection).await?;
        for message in &messages {
            let id = crate::document::id_string(message);
            if !id.is_empty() {
                self.client.delete_document(&collection, &id).await?;
            }
        }
        log::info!("Deleted session {session_id} with {} messages", messages.len());
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> StoreResult<Option<ChatSession>> {
        Ok(self
            .client
            .get_document(SESSIONS, session_id)
            .await?
            .and_then(decode))
    }

    /// Messages of one session, oldest first.
    pub async fn subscribe_messages<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(Vec<ChatMessage>) + Send + Sync + 'static,
    {
        self.client
            .listen_to_collection(&chat_collection(session_id), move |docs| {
                callback(decode_all(docs))
            })
            .await
    }

    /// Every session, most recently active first.
    pub async fn subscribe_sessions<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Vec<ChatSession>) + Send + Sync + 'static,
    {
        self.client
            .listen_to_collection(SESSIONS, move |docs| callback(decode_all(docs)))
            .await
    }

    /// One session, or `None` while it does not exist.
    pub async fn subscribe_session<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(Option<ChatSession>) + Send + Sync + 'static,
    {
        let wanted = session_id.to_string();
        self.client
            .listen_to_collection(SESSIONS, move |docs| {
                let session = docs
                    .into_iter()
                    .filter_map(decode::<ChatSession>)
                    .find(|s| s.id == wanted);
                callback(session)
            })
            .await
    }
}

fn message_id(now: u64) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("msg-{now}-{}", &nonce[..8])
}

fn decode<T: DeserializeOwned>(record: Record) -> Option<T> {
    match serde_json::from_value(Value::Object(record)) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("Skipping malformed chat document: {e}");
            None
        }
    }
}

fn decode_all<T: DeserializeOwned>(docs: Vec<Record>) -> Vec<T> {
    docs.into_iter().filter_map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use crate::error::StoreError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn service() -> ChatService {
        ChatService::new(Arc::new(StoreClient::in_memory(StoreSettings::for_testing())))
    }

    #[tokio::test]
    async fn test_user_message_bumps_unread() {
        let chat = service();
        chat.send_message("abcdef", "hello", Sender::User, None).await.unwrap();
        chat.send_message("abcdef", "anyone?", Sender::User, None).await.unwrap();

        let session = chat.session("abcdef").await.unwrap().unwrap();
        assert_eq!(session.unread_count, 2);
        assert_eq!(session.user_name, "User abcd");
        assert_eq!(session.last_message, "anyone?");
    }

    #[tokio::test]
    async fn test_admin_reply_resets_unread() {
        let chat = service();
        chat.send_message("s1", "hi", Sender::User, None).await.unwrap();
        let attachment = Attachment {
            url: "https://cdn.example.com/images/a.jpg".into(),
            kind: MediaKind::Photo,
        };
        chat.send_message("s1", "", Sender::Admin, Some(attachment)).await.unwrap();

        let session = chat.session("s1").await.unwrap().unwrap();
        assert_eq!(session.unread_count, 0);
        assert_eq!(session.last_message, "[photo]");
    }

    #[tokio::test]
    async fn test_user_rate_limited_admin_not() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(120));
        let chat = ChatService::with_limiter(
            Arc::new(StoreClient::in_memory(StoreSettings::for_testing())),
            limiter,
        );

        chat.send_message("s1", "one", Sender::User, None).await.unwrap();
        assert!(matches!(
            chat.send_message("s1", "two", Sender::User, None).await.unwrap_err(),
            StoreError::RateLimited { .. }
        ));
        chat.send_message("s1", "reply", Sender::Admin, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_and_telegram_id_merge() {
        let chat = service();
        let msg = chat.send_message("s1", "typo", Sender::User, None).await.unwrap();
        chat.edit_message("s1", &msg.id, "fixed").await.unwrap();
        chat.set_telegram_message_id("s1", &msg.id, 555).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = chat
            .subscribe_messages("s1", move |msgs| {
                let _ = tx.send(msgs);
            })
            .await;
        let msgs = rx.recv().await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "fixed");
        assert_eq!(msgs[0].telegram_message_id, Some(555));
        assert_eq!(msgs[0].sender, Sender::User);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_toggle_block_and_mark_read() {
        let chat = service();
        chat.send_message("s1", "hi", Sender::User, None).await.unwrap();

        assert!(chat.toggle_session_block("s1").await.unwrap());
        assert!(!chat.toggle_session_block("s1").await.unwrap());

        chat.mark_session_read("s1").await.unwrap();
        let session = chat.session("s1").await.unwrap().unwrap();
        assert_eq!(session.unread_count, 0);
        assert_eq!(session.blocked, Some(false));
    }

    #[tokio::test]
    async fn test_delete_session_removes_messages() {
        let chat = service();
        let msg = chat.send_message("s1", "a", Sender::User, None).await.unwrap();
        chat.send_message("s1", "b", Sender::Admin, None).await.unwrap();
        chat.delete_message("s1", &msg.id).await.unwrap();

        chat.delete_session("s1").await.unwrap();
        assert!(chat.session("s1").await.unwrap().is_none());
        assert!(chat.client.get_collection("chat_s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_session_missing_then_present() {
        let chat = service();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = chat
            .subscribe_session("s9", move |session| {
                let _ = tx.send(session);
            })
            .await;

        assert!(rx.recv().await.unwrap().is_none());
        chat.send_message("s9", "hello", Sender::User, None).await.unwrap();

        let mut seen = None;
        while let Some(update) = rx.recv().await {
            if update.is_some() {
                seen = update;
                break;
            }
        }
        assert_eq!(seen.unwrap().id, "s9");
        sub.unsubscribe();
    }
}
