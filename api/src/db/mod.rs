pub mod chats;
pub mod document;
pub mod memory;
pub mod models;
pub mod posts;
pub mod sqlite;
pub mod tokens;
pub mod users;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

pub use document::{DocPath, Document, FieldOp, Patch, Query, Write};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const USERS: &str = "users";
pub const POSTS: &str = "posts";
pub const TOKENS: &str = "tokens";
pub const CHATS: &str = "chats";
pub const MESSAGES: &str = "messages";
pub const LAST_CHAT: &str = "lastchat";
/// LastMessage 射影のドキュメントID
pub const LAST_MESSAGE_DOC: &str = "lastmessage";

pub type Db = sqlx::SqlitePool;

/// 共有されるドキュメントストアハンドル
pub type Store = Arc<dyn DocumentStore>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("corrupt document {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("invalid operation: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// ドキュメントデータベースの契約。
///
/// 1回の `commit` に含まれる書き込みはすべて適用されるか、まったく適用されない。
/// サーバタイムスタンプは `commit` 単位で1つの値が割り当てられる。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, DbError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, DbError>;

    async fn commit(&self, writes: Vec<Write>) -> Result<(), DbError>;

    /// 新規ドキュメント用の一意なID
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// 単一書き込みのショートカット
pub async fn write(store: &dyn DocumentStore, write: Write) -> Result<(), DbError> {
    store.commit(vec![write]).await
}

pub(crate) fn decode_all<T: serde::de::DeserializeOwned>(
    docs: Vec<Document>,
) -> Result<Vec<T>, DbError> {
    docs.iter().map(Document::decode::<T>).collect()
}

pub(crate) fn sub_collection(parent: &str, id: &str, child: &str) -> String {
    format!("{parent}/{id}/{child}")
}

/// 書き込み競合時にロック解放を待つ時間
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub async fn connect(url: &str) -> Result<Db, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &Db) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations/sqlite").run(pool).await?;
    Ok(())
}
