use serde_json::{Value, json};

use super::document::{DocPath, Direction, FieldOp, Patch, Query, Write};
use super::models::{Comment, NewPost, Post};
use super::{DbError, DocumentStore, POSTS, decode_all};
use crate::types::{CommentId, PostId, UserId};

fn post_path(id: &PostId) -> DocPath {
    DocPath::new(POSTS, id.as_str())
}

async fn require_post(store: &dyn DocumentStore, id: &PostId) -> Result<Post, DbError> {
    get_post(store, id)
        .await?
        .ok_or_else(|| DbError::NotFound(post_path(id).to_string()))
}

/// 投稿を作成する。メディアはアップロード済みである前提。
#[tracing::instrument(skip(store), err)]
pub async fn create_post(store: &dyn DocumentStore, post: &NewPost) -> Result<Post, DbError> {
    let id = PostId::from(store.new_id());
    let patch = Patch::new()
        .set("id", id.as_str())
        .set("imageUrl", post.image_url.as_str())
        .set("isVideo", post.is_video)
        .set("caption", post.caption.as_str())
        .set("userId", post.user_id.as_str())
        .set("userName", post.user_name.as_str())
        .set("userEmail", post.user_email.as_str())
        .set("likes", json!([]))
        .set("comments", json!([]))
        .server_timestamp("createdAt")
        .server_timestamp("updatedAt");
    super::write(
        store,
        Write::Set {
            path: post_path(&id),
            patch,
        },
    )
    .await?;
    require_post(store, &id).await
}

#[tracing::instrument(skip(store), err)]
pub async fn get_all_posts(store: &dyn DocumentStore) -> Result<Vec<Post>, DbError> {
    let docs = store
        .query(&Query::collection(POSTS).order_by("createdAt", Direction::Descending))
        .await?;
    decode_all(docs)
}

#[tracing::instrument(skip(store), err)]
pub async fn get_posts_by_user(
    store: &dyn DocumentStore,
    user_id: &UserId,
) -> Result<Vec<Post>, DbError> {
    let docs = store
        .query(
            &Query::collection(POSTS)
                .where_eq("userId", user_id.as_str())
                .order_by("createdAt", Direction::Descending),
        )
        .await?;
    decode_all(docs)
}

#[tracing::instrument(skip(store), err)]
pub async fn get_post(store: &dyn DocumentStore, id: &PostId) -> Result<Option<Post>, DbError> {
    match store.get(&post_path(id)).await? {
        Some(doc) => Ok(Some(doc.decode::<Post>()?)),
        None => Ok(None),
    }
}

#[tracing::instrument(skip(store), err)]
pub async fn update_caption(
    store: &dyn DocumentStore,
    id: &PostId,
    caption: &str,
) -> Result<Post, DbError> {
    super::write(
        store,
        Write::Update {
            path: post_path(id),
            patch: Patch::new()
                .set("caption", caption)
                .server_timestamp("updatedAt"),
        },
    )
    .await?;
    require_post(store, id).await
}

/// 投稿を削除する。存在しなかった場合は `false`。
#[tracing::instrument(skip(store), err)]
pub async fn delete_post(store: &dyn DocumentStore, id: &PostId) -> Result<bool, DbError> {
    let path = post_path(id);
    if store.get(&path).await?.is_none() {
        return Ok(false);
    }
    super::write(store, Write::Delete { path }).await?;
    Ok(true)
}

/// いいねを反転する。追加・削除はどちらも集合演算なので他ユーザのいいねと競合しない。
#[tracing::instrument(skip(store), err)]
pub async fn toggle_like(
    store: &dyn DocumentStore,
    post_id: &PostId,
    user_id: &UserId,
) -> Result<Post, DbError> {
    let post = require_post(store, post_id).await?;
    let like = vec![json!({ "userId": user_id.as_str() })];
    let op = if post.is_liked_by(user_id) {
        FieldOp::ArrayRemove(like)
    } else {
        FieldOp::ArrayUnion(like)
    };
    super::write(
        store,
        Write::Update {
            path: post_path(post_id),
            patch: Patch::new().op("likes", op).server_timestamp("updatedAt"),
        },
    )
    .await?;
    require_post(store, post_id).await
}

#[tracing::instrument(skip(store, comment), fields(comment_id = %comment.comment_id), err)]
pub async fn add_comment(
    store: &dyn DocumentStore,
    post_id: &PostId,
    comment: &Comment,
) -> Result<(), DbError> {
    let value = serde_json::to_value(comment)?;
    super::write(
        store,
        Write::Update {
            path: post_path(post_id),
            patch: Patch::new()
                .op("comments", FieldOp::ArrayUnion(vec![value]))
                .server_timestamp("updatedAt"),
        },
    )
    .await
}

/// 投稿のコメント一覧。投稿が存在しない場合は `NotFound`。
#[tracing::instrument(skip(store), err)]
pub async fn get_comments(
    store: &dyn DocumentStore,
    post_id: &PostId,
) -> Result<Vec<Comment>, DbError> {
    Ok(require_post(store, post_id).await?.comments)
}

/// 指定IDのコメントだけを取り除く。保存されている値そのものを `ArrayRemove` する。
#[tracing::instrument(skip(store), err)]
pub async fn delete_comment(
    store: &dyn DocumentStore,
    post_id: &PostId,
    comment_id: &CommentId,
) -> Result<bool, DbError> {
    let Some(doc) = store.get(&post_path(post_id)).await? else {
        return Ok(false);
    };
    let stored: Vec<Value> = doc
        .field("comments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|c| c.get("commentId").and_then(Value::as_str) == Some(comment_id.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if stored.is_empty() {
        return Ok(false);
    }

    super::write(
        store,
        Write::Update {
            path: post_path(post_id),
            patch: Patch::new()
                .op("comments", FieldOp::ArrayRemove(stored))
                .server_timestamp("updatedAt"),
        },
    )
    .await?;
    Ok(true)
}
