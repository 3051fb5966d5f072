pub mod fcm;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::db::{self, Store};
use crate::events::Event;
use crate::types::UserId;

pub use fcm::FcmSender;

/// 通知のアクションカテゴリ。端末側ではこのIDでタップ時の動作を決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Follow,
    Message,
    LikePost,
    CommentPost,
    SignOut,
}

impl NotificationCategory {
    pub fn id(self) -> &'static str {
        match self {
            NotificationCategory::Follow => "follow",
            NotificationCategory::Message => "message",
            NotificationCategory::LikePost => "like_post",
            NotificationCategory::CommentPost => "comment_post",
            NotificationCategory::SignOut => "sign_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub image: Option<String>,
    pub category: NotificationCategory,
    /// 端末に渡す追加データ（遷移先のIDなど）
    pub data: BTreeMap<String, String>,
}

impl Notification {
    fn new(category: NotificationCategory, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            image: None,
            category,
            data: BTreeMap::new(),
        }
    }

    fn with_data(mut self, key: &str, value: impl ToString) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// トークンが無効になっている。登録を削除すべき。
    #[error("push token is no longer registered")]
    Unregistered,
    #[error("push rejected: {0}")]
    Rejected(String),
    #[error("push temporarily failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, notification: &Notification) -> Result<(), PushError>;
}

/// 送信せずにログへ出すだけの送信器
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl PushSender for LogSender {
    async fn send(&self, token: &str, notification: &Notification) -> Result<(), PushError> {
        let suffix = token.get(token.len().saturating_sub(6)..).unwrap_or_default();
        tracing::info!(
            token = %format!("…{suffix}"),
            category = notification.category.id(),
            title = %notification.title,
            body = %notification.body,
            "push notification"
        );
        Ok(())
    }
}

/// イベントから (受信者, 通知) を決める。通知対象でないイベントや自分自身への通知は `None`。
pub fn notification_for(event: &Event) -> Option<(UserId, Notification)> {
    match event {
        Event::Followed {
            follower,
            follower_name,
            target,
        } => Some((
            target.clone(),
            Notification::new(
                NotificationCategory::Follow,
                "New follower",
                format!("{follower_name} started following you"),
            )
            .with_data("userId", follower),
        )),
        Event::PostLiked {
            post,
            author,
            liker,
            liker_name,
        } if liker != author => Some((
            author.clone(),
            Notification::new(
                NotificationCategory::LikePost,
                "New like",
                format!("{liker_name} liked your post"),
            )
            .with_data("postId", post)
            .with_data("userId", liker),
        )),
        Event::CommentAdded {
            post,
            author,
            commenter,
            commenter_name,
            text,
        } if commenter != author => Some((
            author.clone(),
            Notification::new(
                NotificationCategory::CommentPost,
                "New comment",
                format!("{commenter_name} commented: {text}"),
            )
            .with_data("postId", post)
            .with_data("userId", commenter),
        )),
        Event::MessageSent {
            thread,
            message,
            sender,
            sender_name,
            receiver,
            text,
        } => Some((
            receiver.clone(),
            Notification::new(
                NotificationCategory::Message,
                sender_name.clone(),
                if text.is_empty() { "Sent you a photo".to_string() } else { text.clone() },
            )
            .with_data("chatId", thread)
            .with_data("messageId", message)
            .with_data("userId", sender),
        )),
        // 他の端末のセッションを終了させるための通知
        Event::SignedOut { user } => Some((
            user.clone(),
            Notification::new(
                NotificationCategory::SignOut,
                "Signed out",
                "You have been signed out",
            ),
        )),
        _ => None,
    }
}

/// イベントバスを購読し、受信者の全トークンへ通知を配送する
pub struct Dispatcher {
    store: Store,
    sender: Arc<dyn PushSender>,
}

impl Dispatcher {
    pub fn new(store: Store, sender: Arc<dyn PushSender>) -> Self {
        Self { store, sender }
    }

    pub fn spawn(self, mut rx: broadcast::Receiver<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.handle(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notification dispatcher lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("notification dispatcher stopped");
        })
    }

    /// 1件のイベントを処理し、配送できたトークン数を返す
    pub async fn handle(&self, event: &Event) -> usize {
        match notification_for(event) {
            Some((recipient, notification)) => self.deliver(&recipient, &notification).await,
            None => 0,
        }
    }

    /// 失敗はログに残すのみで呼び出し元には返さない
    pub async fn deliver(&self, user: &UserId, notification: &Notification) -> usize {
        let tokens = match db::tokens::get_tokens(self.store.as_ref(), user).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("failed to get push tokens for {user}: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for token in &tokens {
            match self.sender.send(&token.token, notification).await {
                Ok(()) => delivered += 1,
                Err(PushError::Unregistered) => {
                    // 無効化されたトークンは削除
                    tracing::info!("removing unregistered push token for {user}");
                    if let Err(e) = db::tokens::delete_token(self.store.as_ref(), &token.token).await {
                        tracing::warn!("failed to delete push token for {user}: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!("push send error for {user}: {e}");
                }
            }
        }
        delivered
    }
}
