use chrono::Utc;

use crate::AppState;
use crate::db::models::{
    ChatMessage, ChatThread, Comment, InboxEntry, LastMessage, NewPost, OutgoingMessage, Post,
    ProfileField, User,
};
use crate::db::{self, DocumentStore};
use crate::error::AppError;
use crate::events::Event;
use crate::identity::{IdentityStore, Provider};
use crate::session::Session;
use crate::storage::{LocalMedia, UploadedMedia};
use crate::types::{CommentId, MessageId, PostId, ThreadId, UserId};

/// 呼び出し側の窓口。書き込みが確定してからイベントを発行し、
/// サインイン中のユーザ自身が変わった場合はセッションも差し替える。
pub struct SocialClient {
    state: AppState,
    identity: IdentityStore,
}

impl SocialClient {
    pub fn new(state: AppState, identity: IdentityStore) -> Self {
        Self { state, identity }
    }

    fn store(&self) -> &dyn DocumentStore {
        self.state.store.as_ref()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        self.identity.session()
    }

    // ---- identity ----

    pub async fn sign_in(&self, provider: Provider) -> Result<User, AppError> {
        self.identity.sign_in(provider).await
    }

    pub async fn sign_out(&self, provider: Provider) -> Result<(), AppError> {
        self.identity.sign_out(provider).await
    }

    pub async fn sign_in_methods(&self, email: &str) -> Vec<String> {
        self.identity.sign_in_methods(email).await
    }

    pub fn current_user(&self) -> Option<User> {
        self.session().current()
    }

    /// サインイン中のユーザ。未サインインなら `Unauthorized`。
    pub fn require_current_user(&self) -> Result<User, AppError> {
        self.current_user()
            .ok_or_else(|| AppError::Unauthorized("not signed in".into()))
    }

    async fn refresh_session(&self, user: &User) {
        if let Err(e) = self.session().refresh_if_active(user).await {
            tracing::warn!("failed to refresh session for {}: {e}", user.id);
        }
    }

    // ---- users ----

    pub async fn get_user(&self, id: &UserId) -> Result<Option<User>, AppError> {
        Ok(db::users::get_user(self.store(), id).await?)
    }

    async fn require_user(&self, id: &UserId) -> Result<User, AppError> {
        self.get_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))
    }

    pub async fn get_all_users(&self) -> Result<Vec<User>, AppError> {
        Ok(db::users::get_all_users(self.store()).await?)
    }

    pub async fn get_all_users_except(&self, id: &UserId) -> Result<Vec<User>, AppError> {
        Ok(db::users::get_all_users_except(self.store(), id).await?)
    }

    pub async fn search_users(&self, except: &UserId, prefix: &str) -> Result<Vec<User>, AppError> {
        Ok(db::users::search_users(self.store(), except, prefix).await?)
    }

    pub async fn get_followers(&self, id: &UserId) -> Result<Vec<User>, AppError> {
        Ok(db::users::get_followers(self.store(), id).await?)
    }

    pub async fn get_following(&self, id: &UserId) -> Result<Vec<User>, AppError> {
        Ok(db::users::get_following(self.store(), id).await?)
    }

    /// `current` が `target` をフォローし、更新後の `current` を返す
    #[tracing::instrument(skip(self), err)]
    pub async fn follow_user(&self, current: &UserId, target: &UserId) -> Result<User, AppError> {
        let user = db::users::follow_user(self.store(), current, target).await?;
        self.refresh_session(&user).await;
        self.state.events.publish(Event::Followed {
            follower: user.id.clone(),
            follower_name: user.display_name.clone(),
            target: target.clone(),
        });
        Ok(user)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn unfollow_user(&self, current: &UserId, target: &UserId) -> Result<User, AppError> {
        let user = db::users::unfollow_user(self.store(), current, target).await?;
        self.refresh_session(&user).await;
        self.state.events.publish(Event::Unfollowed {
            follower: user.id.clone(),
            target: target.clone(),
        });
        Ok(user)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn update_profile(&self, id: &UserId, fields: &[ProfileField]) -> Result<User, AppError> {
        let today = Utc::now().date_naive();
        let user = db::users::update_profile(self.store(), id, fields, today).await?;
        self.refresh_session(&user).await;
        self.state.events.publish(Event::ProfileUpdated {
            user: user.id.clone(),
        });
        Ok(user)
    }

    /// プッシュトークンが更新された時に呼ぶ。登録簿とユーザドキュメントの両方を更新する。
    #[tracing::instrument(skip(self, token), err)]
    pub async fn refresh_push_token(&self, id: &UserId, token: &str, device_type: &str) -> Result<(), AppError> {
        db::tokens::register_token(self.store(), id, token, device_type).await?;
        db::users::update_fcm_token(self.store(), id, token).await?;
        Ok(())
    }

    // ---- media ----

    pub async fn upload_media(&self, media: &LocalMedia) -> Result<UploadedMedia, AppError> {
        Ok(self.state.uploader.upload(media).await?)
    }

    pub async fn fetch_media(&self, url: &str) -> Result<Vec<u8>, AppError> {
        Ok(self.state.uploader.fetch(url).await?)
    }

    // ---- posts ----

    /// メディアをアップロードしてから投稿を書き込む。
    /// 動画かどうかはアップロード時のコンテンツタイプで決まる。
    #[tracing::instrument(skip(self, author, caption), fields(author = %author.id), err)]
    pub async fn create_post(
        &self,
        author: &User,
        media: &LocalMedia,
        caption: &str,
    ) -> Result<Post, AppError> {
        let uploaded = self.upload_media(media).await?;
        let post = db::posts::create_post(
            self.store(),
            &NewPost {
                image_url: uploaded.url.clone(),
                is_video: uploaded.is_video(),
                caption: caption.to_string(),
                user_id: author.id.clone(),
                user_name: author.display_name.clone(),
                user_email: author.email.clone(),
            },
        )
        .await?;
        self.state.events.publish(Event::PostCreated {
            post: post.id.clone(),
            author: author.id.clone(),
        });
        Ok(post)
    }

    pub async fn get_all_posts(&self) -> Result<Vec<Post>, AppError> {
        Ok(db::posts::get_all_posts(self.store()).await?)
    }

    pub async fn get_posts_by_user(&self, id: &UserId) -> Result<Vec<Post>, AppError> {
        Ok(db::posts::get_posts_by_user(self.store(), id).await?)
    }

    pub async fn get_post(&self, id: &PostId) -> Result<Option<Post>, AppError> {
        Ok(db::posts::get_post(self.store(), id).await?)
    }

    pub async fn update_caption(&self, id: &PostId, caption: &str) -> Result<Post, AppError> {
        Ok(db::posts::update_caption(self.store(), id, caption).await?)
    }

    pub async fn delete_post(&self, id: &PostId) -> Result<bool, AppError> {
        Ok(db::posts::delete_post(self.store(), id).await?)
    }

    /// いいねを反転する。付いた場合のみ `PostLiked` を発行する。
    #[tracing::instrument(skip(self, user), fields(user = %user.id), err)]
    pub async fn toggle_like(&self, post_id: &PostId, user: &User) -> Result<Post, AppError> {
        let post = db::posts::toggle_like(self.store(), post_id, &user.id).await?;
        if post.is_liked_by(&user.id) {
            self.state.events.publish(Event::PostLiked {
                post: post.id.clone(),
                author: post.user_id.clone(),
                liker: user.id.clone(),
                liker_name: user.display_name.clone(),
            });
        }
        Ok(post)
    }

    #[tracing::instrument(skip(self, author, text), fields(author = %author.id), err)]
    pub async fn add_comment(&self, post_id: &PostId, author: &User, text: &str) -> Result<Comment, AppError> {
        let post = self
            .get_post(post_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("post {post_id}")))?;
        let comment = Comment::new(post_id.clone(), text, author, Utc::now());
        db::posts::add_comment(self.store(), post_id, &comment).await?;
        self.state.events.publish(Event::CommentAdded {
            post: post_id.clone(),
            author: post.user_id,
            commenter: author.id.clone(),
            commenter_name: author.display_name.clone(),
            text: comment.comment.clone(),
        });
        Ok(comment)
    }

    pub async fn get_comments(&self, post_id: &PostId) -> Result<Vec<Comment>, AppError> {
        Ok(db::posts::get_comments(self.store(), post_id).await?)
    }

    pub async fn delete_comment(&self, post_id: &PostId, comment_id: &CommentId) -> Result<bool, AppError> {
        Ok(db::posts::delete_comment(self.store(), post_id, comment_id).await?)
    }

    // ---- chats ----

    /// スレッドIDは送信者と受信者から決まる
    #[tracing::instrument(skip(self, message), fields(sender = %message.sender.id, receiver = %message.receiver.id), err)]
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<ChatMessage, AppError> {
        let thread = ThreadId::between(&message.sender.id, &message.receiver.id);
        let stored = db::chats::send_message(self.store(), &thread, &message).await?;
        self.state.events.publish(Event::MessageSent {
            thread,
            message: stored.id.clone(),
            sender: stored.sender_id.clone(),
            sender_name: stored.user.name.clone(),
            receiver: stored.receiver_id.clone(),
            text: stored.text.clone(),
        });
        Ok(stored)
    }

    pub async fn send_text(&self, sender: &User, receiver: &User, text: &str) -> Result<ChatMessage, AppError> {
        self.send_message(OutgoingMessage::text(
            sender.participant(),
            receiver.participant(),
            text,
        ))
        .await
    }

    /// アップロード済みのメディアを添付して送る。送信に失敗しても同じ `media` で再送できる。
    pub async fn send_media(
        &self,
        sender: &User,
        receiver: &User,
        media: &UploadedMedia,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        let mut message = OutgoingMessage::text(sender.participant(), receiver.participant(), text);
        if media.is_video() {
            message.video = Some(media.url.clone());
        } else {
            message.image = Some(media.url.clone());
        }
        self.send_message(message).await
    }

    /// アップロードしてから送る
    pub async fn send_image(
        &self,
        sender: &User,
        receiver: &User,
        media: &LocalMedia,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        let uploaded = self.upload_media(media).await?;
        self.send_media(sender, receiver, &uploaded, text)
            .await
            .inspect_err(|e| tracing::warn!(url = %uploaded.url, "media uploaded but message failed: {e}"))
    }

    pub async fn get_messages(&self, thread: &ThreadId) -> Result<Vec<ChatMessage>, AppError> {
        Ok(db::chats::get_messages(self.store(), thread).await?)
    }

    pub async fn delete_message(&self, thread: &ThreadId, id: &MessageId) -> Result<bool, AppError> {
        Ok(db::chats::delete_message(self.store(), thread, id).await?)
    }

    pub async fn get_thread(&self, thread: &ThreadId) -> Result<Option<ChatThread>, AppError> {
        Ok(db::chats::get_thread(self.store(), thread).await?)
    }

    pub async fn get_last_message(&self, thread: &ThreadId) -> Result<Option<LastMessage>, AppError> {
        Ok(db::chats::get_last_message(self.store(), thread).await?)
    }

    pub async fn get_inbox(&self, user: &UserId) -> Result<Vec<InboxEntry>, AppError> {
        Ok(db::chats::get_inbox(self.store(), user).await?)
    }

    pub async fn mark_read(&self, thread: &ThreadId, user: &UserId) -> Result<(), AppError> {
        Ok(db::chats::mark_read(self.store(), thread, user).await?)
    }

    /// 相手ユーザとのスレッドを開くためのヘルパ
    pub async fn chat_with(&self, me: &UserId, other: &UserId) -> Result<(User, ThreadId), AppError> {
        let user = self.require_user(other).await?;
        Ok((user, ThreadId::between(me, other)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::broadcast;

    use super::*;
    use crate::config::AppConfig;
    use crate::db::models::SignInProfile;
    use crate::db::{MemoryStore, Store};
    use crate::events::EventBus;
    use crate::identity::memory::{MemoryAuthBackend, StaticCredentials, StaticPushRegistrar};
    use crate::session::MemorySessionCache;
    use crate::storage::{MediaUploader, MemoryStorage, RetryPolicy};

    const MEDIA_BASE: &str = "https://socialappimageaws.s3.ap-south-1.amazonaws.com";

    struct Harness {
        client: SocialClient,
        backend: Arc<MemoryAuthBackend>,
        credentials: Arc<StaticCredentials>,
        events: broadcast::Receiver<Event>,
    }

    fn harness() -> Harness {
        let store: Store = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStorage::new(MEDIA_BASE));
        let bus = EventBus::default();
        let events = bus.subscribe();
        let state = AppState {
            store: store.clone(),
            config: AppConfig::for_tests(),
            uploader: Arc::new(MediaUploader::new(storage, RetryPolicy::default())),
            events: bus.clone(),
        };
        let backend = Arc::new(MemoryAuthBackend::new());
        let credentials = Arc::new(StaticCredentials::new());
        let identity = IdentityStore::new(
            store,
            credentials.clone(),
            backend.clone(),
            Arc::new(StaticPushRegistrar::granted("fcm-token", "android")),
            Session::new(Arc::new(MemorySessionCache::new())),
            bus,
        );
        Harness {
            client: SocialClient::new(state, identity),
            backend,
            credentials,
            events,
        }
    }

    async fn seed_user(client: &SocialClient, id: &str, name: &str) -> User {
        db::users::record_sign_in(
            client.store(),
            &SignInProfile {
                id: UserId::from(id),
                email: format!("{id}@example.com"),
                display_name: name.into(),
                photo_url: None,
                provider_id: "google.com".into(),
                fcm_token: None,
            },
        )
        .await
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn sign_in_then_follow_updates_graph_and_session() {
        let mut h = harness();
        h.credentials.set(Provider::Google, "g1");
        h.backend
            .register_identity(Provider::Google, "g1", "alice@example.com", "Alice");
        let u1 = h.client.sign_in(Provider::Google).await.unwrap();
        let u2 = seed_user(&h.client, "u2", "Bob").await;

        let others = h.client.get_all_users_except(&u1.id).await.unwrap();
        assert!(others.iter().any(|u| u.id == u2.id));

        let me = h.client.follow_user(&u1.id, &u2.id).await.unwrap();
        assert_eq!(me.following, vec![u2.id.clone()]);
        let bob = h.client.get_user(&u2.id).await.unwrap().unwrap();
        assert_eq!(bob.followers, vec![u1.id.clone()]);
        assert_eq!(h.client.current_user().unwrap().following, vec![u2.id.clone()]);

        let events = drain(&mut h.events);
        assert!(events.contains(&Event::Followed {
            follower: u1.id.clone(),
            follower_name: "Alice".into(),
            target: u2.id.clone(),
        }));

        h.client.unfollow_user(&u1.id, &u2.id).await.unwrap();
        assert!(h.client.current_user().unwrap().following.is_empty());
    }

    #[tokio::test]
    async fn profile_edit_refreshes_session_and_sign_out_clears_it() {
        let h = harness();
        h.credentials.set(Provider::Facebook, "fb");
        h.backend
            .register_identity(Provider::Facebook, "fb", "carol@example.com", "Carol");
        let me = h.client.sign_in(Provider::Facebook).await.unwrap();
        let mut watch = h.client.session().subscribe();
        watch.mark_unchanged();

        h.client
            .update_profile(&me.id, &[ProfileField::Bio("hello".into())])
            .await
            .unwrap();
        assert!(watch.has_changed().unwrap());
        assert_eq!(h.client.current_user().unwrap().bio.as_deref(), Some("hello"));

        h.client
            .refresh_push_token(&me.id, "fcm-rotated", "ios")
            .await
            .unwrap();
        let stored = h.client.get_user(&me.id).await.unwrap().unwrap();
        assert_eq!(stored.fcm_token.as_deref(), Some("fcm-rotated"));
        let tokens = db::tokens::get_tokens(h.client.store(), &me.id).await.unwrap();
        assert_eq!(tokens.len(), 2);

        h.client.sign_out(Provider::Facebook).await.unwrap();
        assert!(h.client.current_user().is_none());
        assert!(h.credentials.revoked(Provider::Facebook));
        assert!(h.client.require_current_user().is_err());
    }

    #[tokio::test]
    async fn message_updates_projection_and_inbox() {
        let mut h = harness();
        let a = seed_user(&h.client, "u1", "Alice").await;
        let b = seed_user(&h.client, "u2", "Bob").await;

        let sent = h.client.send_text(&a, &b, "hi").await.unwrap();
        let thread = ThreadId::between(&a.id, &b.id);
        let last = h.client.get_last_message(&thread).await.unwrap().unwrap();
        assert_eq!(last.last_message, "hi");
        assert_eq!(last.unread_for(&b.id), 1);

        let inbox = h.client.get_inbox(&b.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].user_id, a.id);
        assert_eq!(inbox[0].user_name, "Alice");

        h.client.mark_read(&thread, &b.id).await.unwrap();
        assert_eq!(h.client.get_inbox(&b.id).await.unwrap()[0].unread_count, 0);

        let events = drain(&mut h.events);
        assert!(matches!(
            events.last(),
            Some(Event::MessageSent { message, receiver, .. }) if *message == sent.id && *receiver == b.id
        ));
    }

    #[tokio::test]
    async fn post_with_video_upload_round_trips() {
        let h = harness();
        let author = seed_user(&h.client, "u1", "Alice").await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really a video").unwrap();

        let media = LocalMedia::new(format!("file://{}", path.display())).with_content_type("video/mp4");
        let post = h.client.create_post(&author, &media, "first").await.unwrap();
        assert!(post.is_video);
        assert!(post.image_url.starts_with(MEDIA_BASE));
        assert_eq!(
            h.client.fetch_media(&post.image_url).await.unwrap(),
            b"not really a video"
        );
        assert_eq!(h.client.get_posts_by_user(&author.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn like_twice_restores_and_only_emits_on_like() {
        let mut h = harness();
        let author = seed_user(&h.client, "u1", "Alice").await;
        let fan = seed_user(&h.client, "u2", "Bob").await;
        let post = h
            .client
            .create_post(
                &author,
                &LocalMedia::new("/nonexistent/photo.jpg"),
                "never written",
            )
            .await;
        assert!(matches!(post, Err(AppError::NotFound(_))));

        let created = db::posts::create_post(
            h.client.store(),
            &NewPost {
                image_url: format!("{MEDIA_BASE}/uploads/x.jpg"),
                is_video: false,
                caption: "hi".into(),
                user_id: author.id.clone(),
                user_name: author.display_name.clone(),
                user_email: author.email.clone(),
            },
        )
        .await
        .unwrap();
        drain(&mut h.events);

        let liked = h.client.toggle_like(&created.id, &fan).await.unwrap();
        assert!(liked.is_liked_by(&fan.id));
        let unliked = h.client.toggle_like(&created.id, &fan).await.unwrap();
        assert_eq!(unliked.likes, created.likes);

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::PostLiked { author: a, .. } if *a == author.id));
    }

    #[tokio::test]
    async fn comments_add_and_delete_by_id() {
        let h = harness();
        let author = seed_user(&h.client, "u1", "Alice").await;
        let other = seed_user(&h.client, "u2", "Bob").await;
        let post = db::posts::create_post(
            h.client.store(),
            &NewPost {
                image_url: format!("{MEDIA_BASE}/uploads/y.jpg"),
                is_video: false,
                caption: String::new(),
                user_id: author.id.clone(),
                user_name: author.display_name.clone(),
                user_email: author.email.clone(),
            },
        )
        .await
        .unwrap();

        let first = h.client.add_comment(&post.id, &other, "nice").await.unwrap();
        let second = h.client.add_comment(&post.id, &author, "thanks").await.unwrap();
        assert_eq!(h.client.get_comments(&post.id).await.unwrap().len(), 2);

        assert!(h.client.delete_comment(&post.id, &first.comment_id).await.unwrap());
        let remaining = h.client.get_comments(&post.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].comment_id, second.comment_id);

        let missing = h.client.add_comment(&PostId::from("gone"), &other, "x").await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
