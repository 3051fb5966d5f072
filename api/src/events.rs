use tokio::sync::broadcast;

use crate::types::{MessageId, PostId, ThreadId, UserId};

/// 状態を変更する操作が書き込み確定後に発行するイベント
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SignedIn {
        user: UserId,
    },
    SignedOut {
        user: UserId,
    },
    Followed {
        follower: UserId,
        follower_name: String,
        target: UserId,
    },
    Unfollowed {
        follower: UserId,
        target: UserId,
    },
    ProfileUpdated {
        user: UserId,
    },
    PostCreated {
        post: PostId,
        author: UserId,
    },
    /// いいねが付いた時のみ。取り消しでは発行しない。
    PostLiked {
        post: PostId,
        author: UserId,
        liker: UserId,
        liker_name: String,
    },
    CommentAdded {
        post: PostId,
        author: UserId,
        commenter: UserId,
        commenter_name: String,
        text: String,
    },
    MessageSent {
        thread: ThreadId,
        message: MessageId,
        sender: UserId,
        sender_name: String,
        receiver: UserId,
        text: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SignedIn { .. } => "signed_in",
            Event::SignedOut { .. } => "signed_out",
            Event::Followed { .. } => "followed",
            Event::Unfollowed { .. } => "unfollowed",
            Event::ProfileUpdated { .. } => "profile_updated",
            Event::PostCreated { .. } => "post_created",
            Event::PostLiked { .. } => "post_liked",
            Event::CommentAdded { .. } => "comment_added",
            Event::MessageSent { .. } => "message_sent",
        }
    }
}

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// 購読者がいなくてもエラーにはしない
    pub fn publish(&self, event: Event) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => tracing::trace!(event = name, receivers, "event published"),
            Err(_) => tracing::trace!(event = name, "event dropped: no subscribers"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
