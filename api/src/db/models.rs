use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CommentId, MessageId, PostId, ThreadId, UserId};

/// ストアが割り当てるサーバタイムスタンプ。
/// ドキュメント上は固定幅の RFC 3339 文字列として格納される。
pub type Timestamp = chrono::DateTime<chrono::Utc>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    /// `DD/MM/YYYY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hometown: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub followers: Vec<UserId>,
    #[serde(default)]
    pub following: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_token: Option<String>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl User {
    pub fn is_following(&self, other: &UserId) -> bool {
        self.following.contains(other)
    }

    pub fn participant(&self) -> Participant {
        Participant {
            id: self.id.clone(),
            name: self.display_name.clone(),
            avatar: self.photo_url.clone(),
        }
    }
}

/// 認証プロバイダから得たサインイン時のプロフィール
#[derive(Debug, Clone, PartialEq)]
pub struct SignInProfile {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    /// `google.com` / `facebook.com`
    pub provider_id: String,
    pub fcm_token: Option<String>,
}

/// プロフィール編集で変更できるフィールド。指定したものだけが更新される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum ProfileField {
    DisplayName(String),
    PhotoUrl(String),
    Age(u32),
    Gender(String),
    Bio(String),
    Dob(String),
    Work(String),
    Education(String),
    Hometown(String),
    Labels(Vec<String>),
}

impl ProfileField {
    /// ユーザドキュメント上のフィールド名
    pub fn field_name(&self) -> &'static str {
        match self {
            ProfileField::DisplayName(_) => "displayName",
            ProfileField::PhotoUrl(_) => "photoURL",
            ProfileField::Age(_) => "age",
            ProfileField::Gender(_) => "gender",
            ProfileField::Bio(_) => "bio",
            ProfileField::Dob(_) => "dob",
            ProfileField::Work(_) => "work",
            ProfileField::Education(_) => "education",
            ProfileField::Hometown(_) => "hometown",
            ProfileField::Labels(_) => "labels",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            ProfileField::DisplayName(s)
            | ProfileField::PhotoUrl(s)
            | ProfileField::Gender(s)
            | ProfileField::Bio(s)
            | ProfileField::Dob(s)
            | ProfileField::Work(s)
            | ProfileField::Education(s)
            | ProfileField::Hometown(s) => Value::String(s.clone()),
            ProfileField::Age(age) => Value::from(*age),
            ProfileField::Labels(labels) => Value::from(labels.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub image_url: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub caption: String,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    #[serde(default)]
    pub likes: Vec<Like>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Post {
    pub fn is_liked_by(&self, user: &UserId) -> bool {
        self.likes.iter().any(|like| &like.user_id == user)
    }

    /// いいねを反転させた後の集合。ストア側の `toggle_like` と同じ結果になる。
    pub fn toggled_likes(&self, user: &UserId) -> Vec<Like> {
        if self.is_liked_by(user) {
            self.likes
                .iter()
                .filter(|like| &like.user_id != user)
                .cloned()
                .collect()
        } else {
            let mut likes = self.likes.clone();
            likes.push(Like {
                user_id: user.clone(),
            });
            likes
        }
    }
}

/// 投稿作成時の入力。`image_url` はアップロード済みのメディアURL。
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub image_url: String,
    pub is_video: bool,
    pub caption: String,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub comment_id: CommentId,
    pub comment: String,
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub profile_uri: Option<String>,
    pub post_id: PostId,
    /// 配列要素にはサーバタイムスタンプを置けないためクライアント時刻
    pub timestamp: Timestamp,
}

impl Comment {
    pub fn new(post_id: PostId, text: impl Into<String>, author: &User, now: Timestamp) -> Self {
        Self {
            comment_id: CommentId::new_v4(),
            comment: text.into(),
            user_id: author.id.clone(),
            user_name: author.display_name.clone(),
            profile_uri: author.photo_url.clone(),
            post_id,
            timestamp: now,
        }
    }
}

/// メッセージの送信者・受信者の表示情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub user: Participant,
    pub receiver_user: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
}

/// 送信前のメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub text: String,
    pub sender: Participant,
    pub receiver: Participant,
    pub image: Option<String>,
    pub video: Option<String>,
}

impl OutgoingMessage {
    pub fn text(sender: Participant, receiver: Participant, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender,
            receiver,
            image: None,
            video: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatThread {
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub participant_names: BTreeMap<String, String>,
    #[serde(default)]
    pub participant_avatars: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// `chats/{thread}/lastchat/lastmessage` の非正規化射影
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_timestamp: Option<Timestamp>,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub participant_names: BTreeMap<String, String>,
    #[serde(default)]
    pub participant_avatars: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub unread_count: BTreeMap<String, u32>,
}

impl LastMessage {
    pub fn unread_for(&self, user: &UserId) -> u32 {
        self.unread_count.get(user.as_str()).copied().unwrap_or(0)
    }
}

/// 受信箱の1行。相手ユーザの情報と最終メッセージをまとめたもの。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub chat_id: ThreadId,
    pub last_message: String,
    pub timestamp: Option<Timestamp>,
    pub user_id: UserId,
    pub user_name: String,
    pub user_avatar: Option<String>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub user_id: UserId,
    pub token: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}
