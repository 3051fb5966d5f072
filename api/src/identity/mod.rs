pub mod firebase;
pub mod memory;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::models::{SignInProfile, User};
use crate::db::{self, Store};
use crate::error::AppError;
use crate::events::{Event, EventBus};
use crate::session::Session;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "google.com")]
    Google,
    #[serde(rename = "facebook.com")]
    Facebook,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Google, Provider::Facebook];

    /// 認証バックエンドでのプロバイダID
    pub fn id(self) -> &'static str {
        match self {
            Provider::Google => "google.com",
            Provider::Facebook => "facebook.com",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" | "google.com" => Ok(Provider::Google),
            "facebook" | "facebook.com" => Ok(Provider::Facebook),
            other => Err(AuthError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// プロバイダSDKから得たトークン。Google は ID トークン、Facebook はアクセストークン。
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider: Provider,
    pub token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// 認証バックエンド上のアカウント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAccount {
    pub uid: UserId,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    /// 紐付いているプロバイダID
    pub providers: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("an account already exists for {email} with a different credential")]
    AccountExistsWithDifferentCredential { email: String },
    #[error("sign-in was cancelled")]
    Cancelled,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("no account is signed in")]
    NotSignedIn,
    #[error("network error: {0}")]
    Network(String),
    #[error("auth backend error: {0}")]
    Backend(String),
}

/// プロバイダSDK（Google Sign-In / Facebook Login）
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// ユーザがキャンセルした場合は `AuthError::Cancelled`
    async fn credential(&self, provider: Provider) -> Result<Credential, AuthError>;

    async fn revoke(&self, provider: Provider) -> Result<(), AuthError>;
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError>;

    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, AuthError>;

    /// 現在サインイン中のアカウントに資格情報を紐付ける
    async fn link_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}

/// 通知権限とプッシュトークンの取得
#[async_trait]
pub trait PushRegistrar: Send + Sync {
    /// 許可（仮許可を含む）されていれば `true`
    async fn request_permission(&self) -> Result<bool, AuthError>;

    async fn token(&self) -> Result<String, AuthError>;

    fn device_type(&self) -> &str;
}

pub struct IdentityStore {
    store: Store,
    credentials: Arc<dyn CredentialSource>,
    backend: Arc<dyn AuthBackend>,
    push: Arc<dyn PushRegistrar>,
    session: Session,
    events: EventBus,
}

impl IdentityStore {
    pub fn new(
        store: Store,
        credentials: Arc<dyn CredentialSource>,
        backend: Arc<dyn AuthBackend>,
        push: Arc<dyn PushRegistrar>,
        session: Session,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            credentials,
            backend,
            push,
            session,
            events,
        }
    }

    /// 指定プロバイダでサインインする。
    ///
    /// 同じメールアドレスが別プロバイダで登録済みの場合は、登録済みプロバイダで
    /// サインインしてから今回の資格情報を紐付け、統合されたユーザを返す。
    #[tracing::instrument(skip(self), err)]
    pub async fn sign_in(&self, provider: Provider) -> Result<User, AppError> {
        let credential = self.credentials.credential(provider).await?;
        match self.backend.sign_in_with_credential(&credential).await {
            Ok(account) => self.complete_sign_in(account, provider).await,
            Err(AuthError::AccountExistsWithDifferentCredential { email }) => {
                self.reconcile(credential, email).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile(&self, credential: Credential, email: String) -> Result<User, AppError> {
        let attempted = credential.provider;
        let methods = self.backend.fetch_sign_in_methods(&email).await?;
        let Some(fallback) = methods
            .iter()
            .filter_map(|m| Provider::from_id(m))
            .find(|p| *p != attempted)
        else {
            return Err(AppError::AuthConflict { email, methods });
        };

        tracing::info!(%attempted, %fallback, "linking credential to existing account");
        let existing = self.credentials.credential(fallback).await?;
        self.backend.sign_in_with_credential(&existing).await?;
        let account = self.backend.link_with_credential(&credential).await?;
        self.complete_sign_in(account, attempted).await
    }

    async fn complete_sign_in(&self, account: AuthAccount, provider: Provider) -> Result<User, AppError> {
        let fcm_token = self.push_token().await;
        if let Some(token) = &fcm_token {
            db::tokens::register_token(self.store.as_ref(), &account.uid, token, self.push.device_type())
                .await?;
        }

        let profile = SignInProfile {
            id: account.uid,
            email: account.email.unwrap_or_default(),
            display_name: account.display_name.unwrap_or_default(),
            photo_url: account.photo_url,
            provider_id: provider.id().to_string(),
            fcm_token,
        };
        let user = db::users::record_sign_in(self.store.as_ref(), &profile).await?;

        if let Err(e) = self.session.replace(user.clone()).await {
            tracing::warn!("failed to persist session: {e}");
        }
        self.events.publish(Event::SignedIn {
            user: user.id.clone(),
        });
        Ok(user)
    }

    /// 通知が拒否された、またはトークンが取れない場合は `None`
    async fn push_token(&self) -> Option<String> {
        match self.push.request_permission().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!("notification permission request failed: {e}");
                return None;
            }
        }
        match self.push.token().await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!("failed to get push token: {e}");
                None
            }
        }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn sign_out(&self, provider: Provider) -> Result<(), AppError> {
        let user = self.session.current();
        self.credentials.revoke(provider).await?;
        self.backend.sign_out().await?;
        if let Err(e) = self.session.clear().await {
            tracing::warn!("failed to clear session cache: {e}");
        }
        if let Some(user) = user {
            self.events.publish(Event::SignedOut { user: user.id });
        }
        Ok(())
    }

    /// メールアドレスに紐付いたサインイン方法。取得に失敗した場合は空。
    pub async fn sign_in_methods(&self, email: &str) -> Vec<String> {
        match self.backend.fetch_sign_in_methods(email).await {
            Ok(methods) => methods,
            Err(e) => {
                tracing::warn!("failed to fetch sign-in methods: {e}");
                Vec::new()
            }
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
