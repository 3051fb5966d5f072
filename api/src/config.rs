use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    /// S3互換ストレージ用の公開URLベース。未設定なら `https://<bucket>.s3.<region>.amazonaws.com`
    pub media_public_base_url: Option<String>,
    /// アップロードの最大試行回数（初回を含む）
    pub upload_max_attempts: u32,
    /// リトライ間隔の基準値。試行ごとに倍になる
    pub upload_retry_base: Duration,
    /// ローカルセッションキャッシュのファイルパス
    pub session_cache_path: PathBuf,
    /// Firebase Identity Toolkit の Web API キー
    pub firebase_api_key: Option<String>,
    pub fcm_project_id: Option<String>,
    /// FCM HTTP v1 の OAuth2 アクセストークン
    pub fcm_access_token: Option<String>,
    /// トークン登録時に記録する端末種別
    pub device_type: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:refresh.db?mode=rwc".into()),
            s3_bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "socialappimageaws".into()),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "ap-south-1".into()),
            media_public_base_url: env::var("MEDIA_PUBLIC_BASE_URL").ok(),
            upload_max_attempts: env::var("UPLOAD_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            upload_retry_base: Duration::from_millis(
                env::var("UPLOAD_RETRY_BASE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(200),
            ),
            session_cache_path: env::var("SESSION_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".refresh-session.json")),
            firebase_api_key: env::var("FIREBASE_API_KEY").ok(),
            fcm_project_id: env::var("FCM_PROJECT_ID").ok(),
            fcm_access_token: env::var("FCM_ACCESS_TOKEN").ok(),
            device_type: env::var("DEVICE_TYPE").unwrap_or_else(|_| env::consts::OS.into()),
        }
    }

    /// オブジェクトキーから公開URLを組み立てるためのベースURL（末尾スラッシュなし）
    pub fn media_base_url(&self) -> String {
        match &self.media_public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}.s3.{}.amazonaws.com",
                self.s3_bucket, self.s3_region
            ),
        }
    }
}

#[cfg(test)]
impl AppConfig {
    /// テスト用の固定設定。環境変数は読まない。
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            s3_bucket: "socialappimageaws".into(),
            s3_endpoint: None,
            s3_region: "ap-south-1".into(),
            media_public_base_url: None,
            upload_max_attempts: 3,
            upload_retry_base: Duration::from_millis(1),
            session_cache_path: PathBuf::from(".refresh-session.json"),
            firebase_api_key: None,
            fcm_project_id: None,
            fcm_access_token: None,
            device_type: "android".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_media_base_url_is_virtual_hosted_s3() {
        let config = AppConfig::for_tests();
        assert_eq!(
            config.media_base_url(),
            "https://socialappimageaws.s3.ap-south-1.amazonaws.com"
        );
    }

    #[test]
    fn custom_media_base_url_drops_trailing_slash() {
        let config = AppConfig {
            media_public_base_url: Some("https://cdn.example.com/media/".into()),
            ..AppConfig::for_tests()
        };
        assert_eq!(config.media_base_url(), "https://cdn.example.com/media");
    }
}
