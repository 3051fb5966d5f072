use serde_json::{Value, json};

use super::document::{DocPath, Direction, FieldOp, Patch, Query, Write};
use super::models::{ChatMessage, ChatThread, InboxEntry, LastMessage, OutgoingMessage, Participant};
use super::{CHATS, DbError, DocumentStore, LAST_CHAT, LAST_MESSAGE_DOC, MESSAGES, decode_all, sub_collection};
use crate::types::{MessageId, ThreadId, UserId};

fn thread_path(thread: &ThreadId) -> DocPath {
    DocPath::new(CHATS, thread.as_str())
}

fn messages_collection(thread: &ThreadId) -> String {
    sub_collection(CHATS, thread.as_str(), MESSAGES)
}

fn last_message_path(thread: &ThreadId) -> DocPath {
    DocPath::new(
        sub_collection(CHATS, thread.as_str(), LAST_CHAT),
        LAST_MESSAGE_DOC,
    )
}

fn participant_value(p: &Participant) -> Value {
    json!({
        "_id": p.id.as_str(),
        "name": p.name,
        "avatar": p.avatar,
    })
}

/// 参加者の名前とアイコンを `participantNames.<id>` 形式のフィールドとして書き込む。
/// ユーザIDは既に検証済みでなければならない。
fn with_participants(mut patch: Patch, sender: &Participant, receiver: &Participant) -> Patch {
    let mut ids = [sender.id.as_str(), receiver.id.as_str()];
    ids.sort_unstable();
    patch = patch.set("participants", json!(ids));
    for p in [sender, receiver] {
        patch = patch
            .set(format!("participantNames.{}", p.id), p.name.as_str())
            .set(format!("participantAvatars.{}", p.id), json!(p.avatar));
    }
    patch
}

/// メッセージを送信する。スレッドのメタデータ、メッセージ本体、最終メッセージ射影の
/// 3つの書き込みを1コミットで行うため、途中までしか反映されない状態は生じない。
#[tracing::instrument(skip(store, message), fields(sender = %message.sender.id, receiver = %message.receiver.id), err)]
pub async fn send_message(
    store: &dyn DocumentStore,
    thread: &ThreadId,
    message: &OutgoingMessage,
) -> Result<ChatMessage, DbError> {
    let (sender, receiver) = (&message.sender, &message.receiver);
    for id in [&sender.id, &receiver.id] {
        UserId::validate(id.as_str()).map_err(DbError::Invalid)?;
    }
    if sender.id == receiver.id {
        return Err(DbError::Invalid(format!(
            "{} cannot message themselves",
            sender.id
        )));
    }
    let expected = ThreadId::between(&sender.id, &receiver.id);
    if &expected != thread {
        return Err(DbError::Invalid(format!(
            "thread {thread} does not belong to {} and {} (expected {expected})",
            sender.id, receiver.id
        )));
    }

    let id = MessageId::from(store.new_id());
    let mut body = Patch::new()
        .set("_id", id.as_str())
        .set("text", message.text.as_str())
        .server_timestamp("createdAt")
        .set("senderId", sender.id.as_str())
        .set("receiverId", receiver.id.as_str())
        .set("user", participant_value(sender))
        .set("receiverUser", participant_value(receiver));
    if let Some(image) = &message.image {
        body = body.set("image", image.as_str());
    }
    if let Some(video) = &message.video {
        body = body.set("video", video.as_str());
    }

    let thread_meta = with_participants(
        Patch::new()
            .op("createdAt", FieldOp::ServerTimestampOnCreate)
            .server_timestamp("updatedAt"),
        sender,
        receiver,
    );
    let projection = with_participants(
        Patch::new()
            .set("lastMessage", message.text.as_str())
            .server_timestamp("lastMessageTimestamp")
            .op(format!("unreadCount.{}", receiver.id), FieldOp::Increment(1))
            .op(
                format!("unreadCount.{}", sender.id),
                FieldOp::SetIfMissing(json!(0)),
            ),
        sender,
        receiver,
    );

    let message_path = DocPath::new(messages_collection(thread), id.as_str());
    store
        .commit(vec![
            Write::Merge {
                path: thread_path(thread),
                patch: thread_meta,
            },
            Write::Set {
                path: message_path.clone(),
                patch: body,
            },
            Write::Merge {
                path: last_message_path(thread),
                patch: projection,
            },
        ])
        .await?;

    store
        .get(&message_path)
        .await?
        .ok_or_else(|| DbError::NotFound(message_path.to_string()))?
        .decode()
}

/// スレッドのメッセージを新しい順に返す
#[tracing::instrument(skip(store), err)]
pub async fn get_messages(
    store: &dyn DocumentStore,
    thread: &ThreadId,
) -> Result<Vec<ChatMessage>, DbError> {
    let docs = store
        .query(&Query::collection(messages_collection(thread)).order_by("createdAt", Direction::Descending))
        .await?;
    decode_all(docs)
}

#[tracing::instrument(skip(store), err)]
pub async fn delete_message(
    store: &dyn DocumentStore,
    thread: &ThreadId,
    id: &MessageId,
) -> Result<bool, DbError> {
    let path = DocPath::new(messages_collection(thread), id.as_str());
    if store.get(&path).await?.is_none() {
        return Ok(false);
    }
    super::write(store, Write::Delete { path }).await?;
    Ok(true)
}

#[tracing::instrument(skip(store), err)]
pub async fn get_thread(
    store: &dyn DocumentStore,
    thread: &ThreadId,
) -> Result<Option<ChatThread>, DbError> {
    match store.get(&thread_path(thread)).await? {
        Some(doc) => Ok(Some(doc.decode::<ChatThread>()?)),
        None => Ok(None),
    }
}

#[tracing::instrument(skip(store), err)]
pub async fn get_last_message(
    store: &dyn DocumentStore,
    thread: &ThreadId,
) -> Result<Option<LastMessage>, DbError> {
    match store.get(&last_message_path(thread)).await? {
        Some(doc) => Ok(Some(doc.decode::<LastMessage>()?)),
        None => Ok(None),
    }
}

/// ユーザの受信箱。参加しているスレッドごとに射影を1回ずつ読む（1 + N 回の読み込み）。
#[tracing::instrument(skip(store), err)]
pub async fn get_inbox(store: &dyn DocumentStore, user: &UserId) -> Result<Vec<InboxEntry>, DbError> {
    let threads = store
        .query(&Query::collection(CHATS).where_array_contains("participants", user.as_str()))
        .await?;

    let mut entries = Vec::with_capacity(threads.len());
    for doc in threads {
        let thread = ThreadId::from(doc.id);
        let Some(last) = get_last_message(store, &thread).await? else {
            tracing::debug!(%thread, "thread has no last message yet");
            continue;
        };
        let other = refresh_common::chat::other_participant(&last.participants, user.as_str())
            .map(UserId::from)
            .unwrap_or_else(|| UserId::from(""));
        entries.push(InboxEntry {
            user_name: last
                .participant_names
                .get(other.as_str())
                .cloned()
                .unwrap_or_default(),
            user_avatar: last
                .participant_avatars
                .get(other.as_str())
                .cloned()
                .flatten(),
            unread_count: last.unread_for(user),
            last_message: last.last_message,
            timestamp: last.last_message_timestamp,
            chat_id: thread,
            user_id: other,
        });
    }

    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(entries)
}

/// 既読にする。`user` の未読数を0に戻す。
#[tracing::instrument(skip(store), err)]
pub async fn mark_read(
    store: &dyn DocumentStore,
    thread: &ThreadId,
    user: &UserId,
) -> Result<(), DbError> {
    UserId::validate(user.as_str()).map_err(DbError::Invalid)?;
    super::write(
        store,
        Write::Update {
            path: last_message_path(thread),
            patch: Patch::new().set(format!("unreadCount.{user}"), 0),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn participant(id: &str, name: &str) -> Participant {
        Participant {
            id: UserId::from(id),
            name: name.into(),
            avatar: None,
        }
    }

    fn hello(from: &str, to: &str, text: &str) -> OutgoingMessage {
        OutgoingMessage::text(participant(from, from), participant(to, to), text)
    }

    fn between(a: &str, b: &str) -> ThreadId {
        ThreadId::between(&UserId::from(a), &UserId::from(b))
    }

    #[tokio::test]
    async fn send_updates_projection_and_inbox() {
        let store = MemoryStore::new();
        let thread = between("u1", "u2");
        let sent = send_message(&store, &thread, &hello("u1", "u2", "hi")).await.unwrap();
        assert_eq!(sent.text, "hi");
        assert!(sent.created_at.is_some());

        let last = get_last_message(&store, &thread).await.unwrap().unwrap();
        assert_eq!(last.last_message, "hi");
        assert_eq!(last.unread_for(&UserId::from("u2")), 1);
        assert_eq!(last.unread_for(&UserId::from("u1")), 0);

        let inbox = get_inbox(&store, &UserId::from("u2")).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].user_id, UserId::from("u1"));
        assert_eq!(inbox[0].user_name, "u1");
        assert_eq!(inbox[0].unread_count, 1);
        assert_eq!(inbox[0].chat_id, thread);

        let thread_doc = get_thread(&store, &thread).await.unwrap().unwrap();
        assert_eq!(
            thread_doc.participants,
            vec![UserId::from("u1"), UserId::from("u2")]
        );
    }

    #[tokio::test]
    async fn messages_are_newest_first() {
        let store = MemoryStore::new();
        let thread = between("u1", "u2");
        for (from, to, text) in [("u1", "u2", "one"), ("u2", "u1", "two"), ("u1", "u2", "three")] {
            send_message(&store, &thread, &hello(from, to, text)).await.unwrap();
        }
        let texts: Vec<_> = get_messages(&store, &thread)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["three", "two", "one"]);

        let last = get_last_message(&store, &thread).await.unwrap().unwrap();
        assert_eq!(last.unread_for(&UserId::from("u2")), 2);
        assert_eq!(last.unread_for(&UserId::from("u1")), 1);
    }

    #[tokio::test]
    async fn inbox_is_sorted_by_latest_message() {
        let store = MemoryStore::new();
        send_message(&store, &between("u1", "u2"), &hello("u2", "u1", "old")).await.unwrap();
        send_message(&store, &between("u1", "u3"), &hello("u3", "u1", "new")).await.unwrap();

        let inbox = get_inbox(&store, &UserId::from("u1")).await.unwrap();
        let others: Vec<_> = inbox.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(others, vec!["u3", "u2"]);
        assert!(get_inbox(&store, &UserId::from("u9")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_mismatched_thread_and_self_messages() {
        let store = MemoryStore::new();
        let wrong = between("u1", "u3");
        assert!(matches!(
            send_message(&store, &wrong, &hello("u1", "u2", "hi")).await,
            Err(DbError::Invalid(_))
        ));
        let me = ThreadId::from("u1_u1");
        assert!(matches!(
            send_message(&store, &me, &hello("u1", "u1", "hi")).await,
            Err(DbError::Invalid(_))
        ));
        assert!(get_inbox(&store, &UserId::from("u1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_read_resets_only_that_user() {
        let store = MemoryStore::new();
        let thread = between("u1", "u2");
        send_message(&store, &thread, &hello("u1", "u2", "a")).await.unwrap();
        send_message(&store, &thread, &hello("u2", "u1", "b")).await.unwrap();

        mark_read(&store, &thread, &UserId::from("u2")).await.unwrap();
        let last = get_last_message(&store, &thread).await.unwrap().unwrap();
        assert_eq!(last.unread_for(&UserId::from("u2")), 0);
        assert_eq!(last.unread_for(&UserId::from("u1")), 1);
    }

    #[tokio::test]
    async fn delete_message_reports_existence() {
        let store = MemoryStore::new();
        let thread = between("u1", "u2");
        let sent = send_message(&store, &thread, &hello("u1", "u2", "oops")).await.unwrap();
        assert!(delete_message(&store, &thread, &sent.id).await.unwrap());
        assert!(!delete_message(&store, &thread, &sent.id).await.unwrap());
        assert!(get_messages(&store, &thread).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_on_sqlite_count_every_message() {
        const PER_SIDE: usize = 10;
        let (_dir, store) = crate::db::sqlite::temp_store().await;
        let store = std::sync::Arc::new(store);
        let thread = between("u1", "u2");

        let tasks: Vec<_> = (0..PER_SIDE * 2)
            .map(|i| {
                let store = store.clone();
                let thread = thread.clone();
                let message = if i % 2 == 0 {
                    hello("u1", "u2", &format!("ping {i}"))
                } else {
                    hello("u2", "u1", &format!("pong {i}"))
                };
                tokio::spawn(async move { send_message(store.as_ref(), &thread, &message).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(get_messages(store.as_ref(), &thread).await.unwrap().len(), PER_SIDE * 2);
        let last = get_last_message(store.as_ref(), &thread).await.unwrap().unwrap();
        assert_eq!(last.unread_for(&UserId::from("u1")), PER_SIDE as u32);
        assert_eq!(last.unread_for(&UserId::from("u2")), PER_SIDE as u32);
    }
}
