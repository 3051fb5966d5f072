use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{ObjectStore, StorageError};
use crate::config::AppConfig;

const UPLOAD_PREFIX: &str = "uploads";
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";
const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 初回を含む試行回数
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.upload_max_attempts,
            base_delay: config.upload_retry_base,
        }
    }

    /// `attempt` 回目の失敗後の待ち時間: base, 2*base, 4*base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// 端末上のメディアファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    /// ファイルパスまたは `file://` URI
    pub uri: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl LocalMedia {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            file_name: None,
            content_type: None,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn path(&self) -> &str {
        self.uri.strip_prefix(FILE_SCHEME).unwrap_or(&self.uri)
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub url: String,
    pub key: String,
    pub content_type: String,
}

impl UploadedMedia {
    pub fn is_video(&self) -> bool {
        self.content_type.starts_with("video/")
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// `uploads/<uuid>-<name>`。名前がなければ `image_<millis>.jpg`。
pub fn object_key(file_name: Option<&str>, now_millis: i64) -> String {
    let name = file_name
        .map(sanitize_file_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("image_{now_millis}.jpg"));
    format!("{UPLOAD_PREFIX}/{}-{name}", uuid::Uuid::new_v4().simple())
}

pub struct MediaUploader {
    storage: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl MediaUploader {
    pub fn new(storage: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    /// ローカルファイルを読み込んでアップロードし、公開URLを返す
    #[tracing::instrument(skip(self), fields(uri = %media.uri), err)]
    pub async fn upload(&self, media: &LocalMedia) -> Result<UploadedMedia, StorageError> {
        let data = tokio::fs::read(media.path()).await?;
        self.upload_bytes(data, media.file_name.as_deref(), media.content_type())
            .await
    }

    #[tracing::instrument(skip(self, data), fields(bytes = data.len()), err)]
    pub async fn upload_bytes(
        &self,
        data: Vec<u8>,
        file_name: Option<&str>,
        content_type: &str,
    ) -> Result<UploadedMedia, StorageError> {
        let key = object_key(file_name, Utc::now().timestamp_millis());
        self.with_retry("put_object", || {
            self.storage.put_object(&key, data.clone(), content_type)
        })
        .await?;
        tracing::debug!(%key, "uploaded media");
        Ok(UploadedMedia {
            url: self.storage.public_url(&key),
            key,
            content_type: content_type.to_string(),
        })
    }

    /// 公開URLからオブジェクトを読み戻す
    #[tracing::instrument(skip(self), err)]
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let key = self
            .storage
            .key_from_url(url)
            .ok_or_else(|| StorageError::NotFound(url.to_string()))?;
        self.with_retry("get_object", || self.storage.get_object(&key))
            .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn delete(&self, url: &str) -> Result<(), StorageError> {
        let key = self
            .storage
            .key_from_url(url)
            .ok_or_else(|| StorageError::NotFound(url.to_string()))?;
        self.with_retry("delete_object", || self.storage.delete_object(&key))
            .await
    }

    /// 一時的な失敗のみ指数バックオフで再試行する
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %e,
                        "storage operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const BASE: &str = "https://socialappimageaws.s3.ap-south-1.amazonaws.com";

    /// 最初の `failures` 回だけ指定のエラーで失敗するストア
    struct Flaky {
        inner: MemoryStorage,
        failures: u32,
        transient: bool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: MemoryStorage::new(BASE),
                failures,
                transient,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for Flaky {
        async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    StorageError::Transient("connection reset".into())
                } else {
                    StorageError::Rejected("access denied".into())
                });
            }
            self.inner.put_object(key, data, content_type).await
        }

        async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.get_object(key).await
        }

        async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete_object(key).await
        }

        fn public_base(&self) -> &str {
            self.inner.public_base()
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn upload_round_trip_from_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo one.png");
        std::fs::write(&path, b"png-bytes").unwrap();

        let storage = Arc::new(MemoryStorage::new(BASE));
        let uploader = MediaUploader::new(storage.clone(), policy(3));
        let media = LocalMedia::new(format!("file://{}", path.display()))
            .with_file_name("photo one.png")
            .with_content_type("image/png");

        let uploaded = uploader.upload(&media).await.unwrap();
        assert!(uploaded.key.starts_with("uploads/"));
        assert!(uploaded.key.ends_with("-photo_one.png"));
        assert_eq!(uploaded.url, format!("{BASE}/{}", uploaded.key));
        assert!(!uploaded.is_video());
        assert_eq!(uploader.fetch(&uploaded.url).await.unwrap(), b"png-bytes");
        assert_eq!(
            storage.content_type(&uploaded.key).await.as_deref(),
            Some("image/png")
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_bound() {
        let flaky = Arc::new(Flaky::new(2, true));
        let uploader = MediaUploader::new(flaky.clone(), policy(3));
        uploader.upload_bytes(vec![1], None, "image/jpeg").await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let flaky = Arc::new(Flaky::new(5, true));
        let uploader = MediaUploader::new(flaky.clone(), policy(3));
        let err = uploader.upload_bytes(vec![1], None, "image/jpeg").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(flaky.inner.is_empty().await);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let flaky = Arc::new(Flaky::new(1, false));
        let uploader = MediaUploader::new(flaky.clone(), policy(5));
        let err = uploader.upload_bytes(vec![1], None, "image/jpeg").await.unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_local_file_is_io_error() {
        let uploader = MediaUploader::new(Arc::new(MemoryStorage::new(BASE)), policy(3));
        let err = uploader
            .upload(&LocalMedia::new("file:///definitely/not/here.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn default_key_uses_timestamp_name() {
        let key = object_key(None, 1_700_000_000_000);
        assert!(key.starts_with("uploads/"));
        assert!(key.ends_with("-image_1700000000000.jpg"));
        let key = object_key(Some("../../etc/passwd"), 0);
        assert!(key.ends_with("-passwd"));
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn content_type_defaults_to_jpeg() {
        let media = LocalMedia::new("/tmp/a");
        assert_eq!(media.content_type(), "image/jpeg");
        assert_eq!(LocalMedia::new("file:///tmp/a").path(), "/tmp/a");
    }
}
