use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::db::models::User;

/// セッションを保存するキー
pub const SESSION_KEY: &str = "@user_data";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session cache is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, SessionError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), SessionError>;

    async fn remove_item(&self, key: &str) -> Result<(), SessionError>;
}

/// キーと値をJSONオブジェクトとして1ファイルに保存する
#[derive(Debug)]
pub struct FileSessionCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, SessionError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, items: &HashMap<String, String>) -> Result<(), SessionError> {
        if items.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(items)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionCache for FileSessionCache {
    async fn get_item(&self, key: &str) -> Result<Option<String>, SessionError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        let mut items = self.read_all().await?;
        items.insert(key.to_string(), value);
        self.write_all(&items).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        let mut items = self.read_all().await?;
        if items.remove(key).is_some() {
            self.write_all(&items).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionCache {
    items: Mutex<HashMap<String, String>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get_item(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), SessionError> {
        self.items.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), SessionError> {
        self.items.lock().await.remove(key);
        Ok(())
    }
}

/// サインイン中のユーザを保持するコンテキスト。
/// 値はまるごと置き換えられ、変更は `subscribe` したレシーバに通知される。
#[derive(Clone)]
pub struct Session {
    cache: Arc<dyn SessionCache>,
    tx: Arc<watch::Sender<Option<User>>>,
}

impl Session {
    pub fn new(cache: Arc<dyn SessionCache>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            cache,
            tx: Arc::new(tx),
        }
    }

    /// キャッシュから前回のセッションを読み込む
    #[tracing::instrument(skip(self), err)]
    pub async fn restore(&self) -> Result<Option<User>, SessionError> {
        let user = match self.cache.get_item(SESSION_KEY).await? {
            Some(json) => Some(serde_json::from_str::<User>(&json)?),
            None => None,
        };
        self.tx.send_replace(user.clone());
        Ok(user)
    }

    pub fn current(&self) -> Option<User> {
        self.tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }

    /// メモリ上の値を先に差し替え、その後キャッシュに保存する
    #[tracing::instrument(skip(self, user), fields(user = %user.id), err)]
    pub async fn replace(&self, user: User) -> Result<(), SessionError> {
        let json = serde_json::to_string(&user)?;
        self.tx.send_replace(Some(user));
        self.cache.set_item(SESSION_KEY, json).await
    }

    /// `user` がサインイン中のユーザであれば差し替える
    pub async fn refresh_if_active(&self, user: &User) -> Result<bool, SessionError> {
        let active = self
            .tx
            .borrow()
            .as_ref()
            .is_some_and(|current| current.id == user.id);
        if active {
            self.replace(user.clone()).await?;
        }
        Ok(active)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn clear(&self) -> Result<(), SessionError> {
        self.tx.send_replace(None);
        self.cache.remove_item(SESSION_KEY).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.tx.borrow().as_ref().map(|u| u.id.clone()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    fn user(id: &str, name: &str) -> User {
        serde_json::from_value(serde_json::json!({ "id": id, "displayName": name })).unwrap()
    }

    #[tokio::test]
    async fn replace_persists_and_notifies() {
        let session = Session::new(Arc::new(MemorySessionCache::new()));
        let mut rx = session.subscribe();
        session.replace(user("u1", "Alice")).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().as_ref().map(|u| u.id.clone()),
            Some(UserId::from("u1"))
        );
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_only_touches_active_user() {
        let session = Session::new(Arc::new(MemorySessionCache::new()));
        session.replace(user("u1", "Alice")).await.unwrap();

        assert!(!session.refresh_if_active(&user("u2", "Bob")).await.unwrap());
        assert!(session.refresh_if_active(&user("u1", "Ally")).await.unwrap());
        assert_eq!(session.current().unwrap().display_name, "Ally");
    }

    #[tokio::test]
    async fn file_cache_survives_restart_and_clear_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let session = Session::new(Arc::new(FileSessionCache::new(&path)));
        session.replace(user("u1", "Alice")).await.unwrap();
        assert!(path.exists());

        let restarted = Session::new(Arc::new(FileSessionCache::new(&path)));
        assert!(restarted.current().is_none());
        let restored = restarted.restore().await.unwrap().unwrap();
        assert_eq!(restored.display_name, "Alice");
        assert_eq!(restarted.current(), Some(restored));

        restarted.clear().await.unwrap();
        assert!(restarted.current().is_none());
        assert!(!path.exists());
        assert!(restarted.restore().await.unwrap().is_none());
    }
}
