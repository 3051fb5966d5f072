use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{AuthAccount, AuthBackend, AuthError, Credential, CredentialSource, Provider, PushRegistrar};
use crate::types::UserId;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Identity {
    email: String,
    display_name: String,
}

#[derive(Debug, Default)]
struct Registry {
    /// (provider, token) → プロバイダ上の本人情報
    identities: HashMap<(Provider, String), Identity>,
    accounts: Vec<AuthAccount>,
    current: Option<UserId>,
}

impl Registry {
    fn account_by_email(&mut self, email: &str) -> Option<&mut AuthAccount> {
        self.accounts
            .iter_mut()
            .find(|a| a.email.as_deref() == Some(email))
    }

    fn create_account(&mut self, email: &str, display_name: &str, provider: &str) -> AuthAccount {
        let account = AuthAccount {
            uid: UserId::new_v4(),
            email: Some(email.to_string()),
            display_name: Some(display_name.to_string()),
            photo_url: None,
            providers: vec![provider.to_string()],
        };
        self.accounts.push(account.clone());
        account
    }

    fn identity(&self, credential: &Credential) -> Result<Identity, AuthError> {
        self.identities
            .get(&(credential.provider, credential.token.clone()))
            .cloned()
            .ok_or_else(|| AuthError::InvalidCredential(format!("unknown {} token", credential.provider)))
    }
}

/// メールアドレス単位でアカウントを持ち、プロバイダの紐付けを管理する認証バックエンド
#[derive(Debug, Default)]
pub struct MemoryAuthBackend {
    registry: Mutex<Registry>,
}

impl MemoryAuthBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// プロバイダ上の本人を登録する。同じメールのアカウントがなければ作成し、
    /// あれば紐付けないまま既存アカウントのIDを返す。
    pub fn register_identity(
        &self,
        provider: Provider,
        token: &str,
        email: &str,
        display_name: &str,
    ) -> UserId {
        let mut registry = lock(&self.registry);
        registry.identities.insert(
            (provider, token.to_string()),
            Identity {
                email: email.to_string(),
                display_name: display_name.to_string(),
            },
        );
        match registry.account_by_email(email) {
            Some(account) => account.uid.clone(),
            None => registry.create_account(email, display_name, provider.id()).uid,
        }
    }

    /// フェデレーション以外（パスワード）のアカウントを登録する
    pub fn register_password_account(&self, email: &str) -> UserId {
        lock(&self.registry).create_account(email, "", "password").uid
    }

    pub fn current(&self) -> Option<UserId> {
        lock(&self.registry).current.clone()
    }
}

#[async_trait]
impl AuthBackend for MemoryAuthBackend {
    async fn sign_in_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError> {
        let mut registry = lock(&self.registry);
        let identity = registry.identity(credential)?;
        let provider = credential.provider.id();

        let account = match registry.account_by_email(&identity.email) {
            Some(account) if account.providers.iter().any(|p| p == provider) => account.clone(),
            Some(_) => {
                return Err(AuthError::AccountExistsWithDifferentCredential {
                    email: identity.email,
                });
            }
            None => registry.create_account(&identity.email, &identity.display_name, provider),
        };
        registry.current = Some(account.uid.clone());
        Ok(account)
    }

    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, AuthError> {
        let mut registry = lock(&self.registry);
        Ok(registry
            .account_by_email(email)
            .map(|a| a.providers.clone())
            .unwrap_or_default())
    }

    async fn link_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError> {
        let mut registry = lock(&self.registry);
        registry.identity(credential)?;
        let current = registry.current.clone().ok_or(AuthError::NotSignedIn)?;
        let account = registry
            .accounts
            .iter_mut()
            .find(|a| a.uid == current)
            .ok_or(AuthError::NotSignedIn)?;
        let provider = credential.provider.id().to_string();
        if !account.providers.contains(&provider) {
            account.providers.push(provider);
        }
        Ok(account.clone())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        lock(&self.registry).current = None;
        Ok(())
    }
}

/// 事前に設定したトークンを返すプロバイダSDK。未設定のプロバイダはキャンセル扱い。
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: Mutex<HashMap<Provider, String>>,
    revoked: Mutex<HashSet<Provider>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, provider: Provider, token: &str) {
        lock(&self.tokens).insert(provider, token.to_string());
    }

    pub fn revoked(&self, provider: Provider) -> bool {
        lock(&self.revoked).contains(&provider)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential(&self, provider: Provider) -> Result<Credential, AuthError> {
        let token = lock(&self.tokens)
            .get(&provider)
            .cloned()
            .ok_or(AuthError::Cancelled)?;
        Ok(Credential { provider, token })
    }

    async fn revoke(&self, provider: Provider) -> Result<(), AuthError> {
        lock(&self.revoked).insert(provider);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StaticPushRegistrar {
    token: Option<String>,
    device_type: String,
}

impl StaticPushRegistrar {
    pub fn granted(token: &str, device_type: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            device_type: device_type.to_string(),
        }
    }

    pub fn denied(device_type: &str) -> Self {
        Self {
            token: None,
            device_type: device_type.to_string(),
        }
    }
}

#[async_trait]
impl PushRegistrar for StaticPushRegistrar {
    async fn request_permission(&self) -> Result<bool, AuthError> {
        Ok(self.token.is_some())
    }

    async fn token(&self) -> Result<String, AuthError> {
        self.token
            .clone()
            .ok_or_else(|| AuthError::Backend("notifications are not permitted".into()))
    }

    fn device_type(&self) -> &str {
        &self.device_type
    }
}
