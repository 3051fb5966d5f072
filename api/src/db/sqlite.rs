use async_trait::async_trait;
use sqlx::SqliteConnection;
use tokio::sync::Mutex;

use super::document::{DocPath, Document, Fields, Query, ServerClock, Write, apply_write};
use super::{Db, DbError, DocumentStore};

/// SQLite の `documents` テーブルに JSON 本体を格納するストア。
/// クエリはコレクション単位で全件読み出してからメモリ上で評価する。
#[derive(Debug)]
pub struct SqliteStore {
    pool: Db,
    clock: ServerClock,
    commit_lock: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: Db) -> Self {
        Self {
            pool,
            clock: ServerClock::new(),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Db {
        &self.pool
    }
}

fn decode_body(path: &DocPath, body: &str) -> Result<Fields, DbError> {
    serde_json::from_str(body).map_err(|e| DbError::Corrupt {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    #[tracing::instrument(skip(self), err)]
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, DbError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM documents WHERE collection = ? AND id = ?")
                .bind(&path.collection)
                .bind(&path.id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((body,)) => Ok(Some(Document {
                id: path.id.clone(),
                data: decode_body(path, &body)?,
            })),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), err)]
    async fn query(&self, query: &Query) -> Result<Vec<Document>, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, data FROM documents WHERE collection = ? ORDER BY id")
                .bind(&query.collection)
                .fetch_all(&self.pool)
                .await?;
        let mut docs = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            let path = DocPath::new(query.collection.clone(), id);
            docs.push(Document {
                data: decode_body(&path, &body)?,
                id: path.id,
            });
        }
        Ok(query.run(docs))
    }

    #[tracing::instrument(skip(self, writes), fields(writes = writes.len()), err)]
    async fn commit(&self, writes: Vec<Write>) -> Result<(), DbError> {
        // プロセス内のコミットは直列化し、タイムスタンプ順とコミット順を一致させる
        let _guard = self.commit_lock.lock().await;
        let now = self.clock.now()?;
        // 読み込み後の書き込みロック昇格で SQLITE_BUSY にならないよう、最初に書き込みロックを取る
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        // エラー時は tx がドロップされロールバックされる
        apply_all(&mut *tx, &writes, &now).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_all(conn: &mut SqliteConnection, writes: &[Write], now: &str) -> Result<(), DbError> {
    for write in writes {
        let path = write.path();
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM documents WHERE collection = ? AND id = ?")
                .bind(&path.collection)
                .bind(&path.id)
                .fetch_optional(&mut *conn)
                .await?;
        let current = row.map(|(body,)| decode_body(path, &body)).transpose()?;

        match apply_write(current, write, now)? {
            Some(fields) => {
                let body = serde_json::to_string(&fields)?;
                sqlx::query(
                    "INSERT INTO documents (collection, id, data, updated_at) VALUES (?, ?, ?, ?)
                     ON CONFLICT (collection, id) DO UPDATE SET
                        data = excluded.data,
                        updated_at = excluded.updated_at",
                )
                .bind(&path.collection)
                .bind(&path.id)
                .bind(body)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                    .bind(&path.collection)
                    .bind(&path.id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }
    Ok(())
}

/// 一時ファイル上のストア。`TempDir` を保持している間だけ有効。
#[cfg(test)]
pub(crate) async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("docs.db").display());
    let pool = super::connect(&url).await.unwrap();
    super::migrate(&pool).await.unwrap();
    (dir, SqliteStore::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document::{Direction, FieldOp, Patch};
    use serde_json::json;

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        temp_store().await
    }

    #[tokio::test]
    async fn round_trips_documents() {
        let (_dir, store) = open().await;
        let path = DocPath::new("users", "u1");
        store
            .commit(vec![Write::Set {
                path: path.clone(),
                patch: Patch::new()
                    .set("displayName", "Alice")
                    .op("followers", FieldOp::ArrayUnion(vec![json!("u2")]))
                    .server_timestamp("createdAt"),
            }])
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.data["displayName"], json!("Alice"));
        assert_eq!(doc.data["followers"], json!(["u2"]));
        assert!(doc.data["createdAt"].is_string());
    }

    #[tokio::test]
    async fn failed_commit_rolls_back() {
        let (_dir, store) = open().await;
        let a = DocPath::new("users", "a");
        let result = store
            .commit(vec![
                Write::Merge {
                    path: a.clone(),
                    patch: Patch::new().set("x", 1),
                },
                Write::Update {
                    path: DocPath::new("users", "missing"),
                    patch: Patch::new().set("x", 1),
                },
            ])
            .await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
        assert!(store.get(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_orders_by_server_timestamp() {
        let (_dir, store) = open().await;
        for id in ["p1", "p2", "p3"] {
            store
                .commit(vec![Write::Set {
                    path: DocPath::new("posts", id),
                    patch: Patch::new().set("id", id).server_timestamp("createdAt"),
                }])
                .await
                .unwrap();
        }
        let docs = store
            .query(&Query::collection("posts").order_by("createdAt", Direction::Descending))
            .await
            .unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2", "p1"]);
    }

    #[tokio::test]
    async fn sub_collections_are_separate() {
        let (_dir, store) = open().await;
        store
            .commit(vec![
                Write::Set {
                    path: DocPath::new("chats", "u1_u2"),
                    patch: Patch::new().set("participants", json!(["u1", "u2"])),
                },
                Write::Set {
                    path: DocPath::new("chats/u1_u2/messages", "m1"),
                    patch: Patch::new().set("text", "hi"),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.query(&Query::collection("chats")).await.unwrap().len(), 1);
        assert_eq!(
            store
                .query(&Query::collection("chats/u1_u2/messages"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
