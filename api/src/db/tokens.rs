use sha2::{Digest, Sha256};

use super::document::{DocPath, FieldOp, Patch, Query, Write};
use super::models::PushToken;
use super::{DbError, DocumentStore, TOKENS, decode_all};
use crate::types::UserId;

/// `(userId, token)` ごとに決まるドキュメントID。同じ端末の再登録は同じドキュメントを更新する。
pub fn token_doc_id(user: &UserId, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[tracing::instrument(skip(store, token), err)]
pub async fn register_token(
    store: &dyn DocumentStore,
    user: &UserId,
    token: &str,
    device_type: &str,
) -> Result<(), DbError> {
    super::write(
        store,
        Write::Merge {
            path: DocPath::new(TOKENS, token_doc_id(user, token)),
            patch: Patch::new()
                .set("userId", user.as_str())
                .set("token", token)
                .set("deviceType", device_type)
                .op("createdAt", FieldOp::ServerTimestampOnCreate)
                .server_timestamp("updatedAt"),
        },
    )
    .await
}

#[tracing::instrument(skip(store), err)]
pub async fn get_tokens(store: &dyn DocumentStore, user: &UserId) -> Result<Vec<PushToken>, DbError> {
    let docs = store
        .query(&Query::collection(TOKENS).where_eq("userId", user.as_str()))
        .await?;
    decode_all(docs)
}

/// トークンを全ユーザ分から削除する。削除件数を返す。
#[tracing::instrument(skip(store, token), err)]
pub async fn delete_token(store: &dyn DocumentStore, token: &str) -> Result<usize, DbError> {
    let docs = store
        .query(&Query::collection(TOKENS).where_eq("token", token))
        .await?;
    let writes: Vec<Write> = docs
        .into_iter()
        .map(|doc| Write::Delete {
            path: DocPath::new(TOKENS, doc.id),
        })
        .collect();
    let deleted = writes.len();
    if deleted > 0 {
        store.commit(writes).await?;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn reregistering_same_token_keeps_one_document() {
        let store = MemoryStore::new();
        let u1 = UserId::from("u1");
        register_token(&store, &u1, "tok-a", "android").await.unwrap();
        let first = get_tokens(&store, &u1).await.unwrap();
        register_token(&store, &u1, "tok-a", "android").await.unwrap();
        register_token(&store, &u1, "tok-b", "ios").await.unwrap();

        let tokens = get_tokens(&store, &u1).await.unwrap();
        assert_eq!(tokens.len(), 2);
        let a = tokens.iter().find(|t| t.token == "tok-a").unwrap();
        assert_eq!(a.created_at, first[0].created_at);
        assert!(a.updated_at > first[0].updated_at);
    }

    #[tokio::test]
    async fn delete_token_removes_every_owner() {
        let store = MemoryStore::new();
        let (u1, u2) = (UserId::from("u1"), UserId::from("u2"));
        register_token(&store, &u1, "shared", "android").await.unwrap();
        register_token(&store, &u2, "shared", "android").await.unwrap();
        register_token(&store, &u2, "other", "android").await.unwrap();

        assert_eq!(delete_token(&store, "shared").await.unwrap(), 2);
        assert!(get_tokens(&store, &u1).await.unwrap().is_empty());
        assert_eq!(get_tokens(&store, &u2).await.unwrap().len(), 1);
        assert_eq!(delete_token(&store, "shared").await.unwrap(), 0);
    }

    #[test]
    fn doc_id_separates_user_and_token() {
        let a = token_doc_id(&UserId::from("ab"), "c");
        let b = token_doc_id(&UserId::from("a"), "bc");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
