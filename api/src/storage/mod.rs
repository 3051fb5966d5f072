pub mod upload;

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use tokio::sync::RwLock;

use crate::config::AppConfig;

pub use upload::{LocalMedia, MediaUploader, RetryPolicy, UploadedMedia};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// タイムアウト・接続断・5xx など、再試行で回復しうる失敗
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage rejected request: {0}")]
    Rejected(String),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// バイナリオブジェクトの保存先。キーから公開URLを導出できる。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// 公開URLのベース（末尾スラッシュなし）
    fn public_base(&self) -> &str;

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base(), key)
    }

    /// このストアの公開URLであればオブジェクトキーを返す
    fn key_from_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(self.public_base())?
            .strip_prefix('/')
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    public_base: String,
}

impl S3Storage {
    pub async fn new(config: &AppConfig) -> Self {
        let mut s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.s3_endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let sdk_config = s3_config
            .region(aws_config::Region::new(config.s3_region.clone()))
            .load()
            .await;

        let client = Client::new(&sdk_config);
        Self {
            client,
            bucket: config.s3_bucket.clone(),
            public_base: config.media_base_url(),
        }
    }
}

/// SDKエラーを再試行可能かどうかで分類する
fn classify<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(service) => service.raw().status().as_u16() >= 500,
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        StorageError::Transient(message)
    } else {
        StorageError::Rejected(message)
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[tracing::instrument(skip(self, data), fields(bytes = data.len()), err)]
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .content_type(content_type)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    classify(e)
                }
            })?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn public_base(&self) -> &str {
        &self.public_base
    }
}

/// プロセス内のオブジェクトストア
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
    public_base: String,
}

impl MemoryStorage {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            objects: RwLock::default(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|(_, ct)| ct.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    fn public_base(&self) -> &str {
        &self.public_base
    }
}
