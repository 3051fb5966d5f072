use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{AuthAccount, AuthBackend, AuthError, Credential, Provider};
use crate::types::UserId;

const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
/// IdP 連携で要求される戻り先URI。ネイティブアプリでは実際には使われない。
const REQUEST_URI: &str = "http://localhost";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpRequest<'a> {
    post_body: String,
    request_uri: &'a str,
    return_idp_credential: bool,
    return_secure_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpResponse {
    #[serde(default)]
    local_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
    /// 同じメールアドレスの既存アカウントがあり、紐付けが必要
    #[serde(default)]
    need_confirmation: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAuthUriRequest<'a> {
    identifier: &'a str,
    continue_uri: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAuthUriResponse {
    #[serde(default)]
    signin_methods: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Clone)]
struct SignedIn {
    uid: UserId,
    id_token: String,
    email: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
    providers: Vec<String>,
}

pub struct FirebaseAuth {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    current: RwLock<Option<SignedIn>>,
}

impl FirebaseAuth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, IDENTITY_TOOLKIT_URL)
    }

    /// エミュレータなど別エンドポイントを使う場合
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            current: RwLock::new(None),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/accounts:{method}?key={}",
            self.base_url,
            urlencoding::encode(&self.api_key)
        )
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &Req,
    ) -> Result<Resp, AuthError> {
        let resp = self
            .client
            .post(self.endpoint(method))
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Network(format!("{method} request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(AuthError::Network(format!("{method} returned {status}")));
        }
        if !status.is_success() {
            let message = resp
                .json::<ErrorEnvelope>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(classify_error(&message));
        }
        resp.json()
            .await
            .map_err(|e| AuthError::Backend(format!("invalid {method} response: {e}")))
    }

    async fn sign_in_with_idp(
        &self,
        credential: &Credential,
        id_token: Option<&str>,
    ) -> Result<SignedIn, AuthError> {
        let request = SignInWithIdpRequest {
            post_body: post_body(credential),
            request_uri: REQUEST_URI,
            return_idp_credential: true,
            return_secure_token: true,
            id_token,
        };
        let resp: SignInWithIdpResponse = self.post("signInWithIdp", &request).await?;

        if resp.need_confirmation {
            return Err(AuthError::AccountExistsWithDifferentCredential {
                email: resp.email.unwrap_or_default(),
            });
        }
        let (Some(uid), Some(id_token)) = (resp.local_id, resp.id_token) else {
            return Err(AuthError::Backend("signInWithIdp returned no account".into()));
        };
        Ok(SignedIn {
            uid: UserId::from(uid),
            id_token,
            email: resp.email,
            display_name: resp.display_name,
            photo_url: resp.photo_url,
            providers: resp.provider_id.into_iter().collect(),
        })
    }
}

/// Google は ID トークン、Facebook はアクセストークンとして渡す
fn post_body(credential: &Credential) -> String {
    let token_field = match credential.provider {
        Provider::Google => "id_token",
        Provider::Facebook => "access_token",
    };
    format!(
        "{token_field}={}&providerId={}",
        urlencoding::encode(&credential.token),
        urlencoding::encode(credential.provider.id())
    )
}

fn classify_error(message: &str) -> AuthError {
    let code = message.split([' ', ':']).next().unwrap_or(message);
    match code {
        "INVALID_IDP_RESPONSE" | "INVALID_ID_TOKEN" | "TOKEN_EXPIRED" | "USER_DISABLED" => {
            AuthError::InvalidCredential(message.to_string())
        }
        "FEDERATED_USER_ID_ALREADY_LINKED" | "EMAIL_EXISTS" => {
            AuthError::Backend(format!("credential is already linked: {message}"))
        }
        _ => AuthError::Backend(message.to_string()),
    }
}

impl From<SignedIn> for AuthAccount {
    fn from(s: SignedIn) -> Self {
        AuthAccount {
            uid: s.uid,
            email: s.email,
            display_name: s.display_name,
            photo_url: s.photo_url,
            providers: s.providers,
        }
    }
}

#[async_trait]
impl AuthBackend for FirebaseAuth {
    #[tracing::instrument(skip(self), err)]
    async fn sign_in_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError> {
        let signed_in = self.sign_in_with_idp(credential, None).await?;
        *self.current.write().await = Some(signed_in.clone());
        Ok(signed_in.into())
    }

    #[tracing::instrument(skip(self), err)]
    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, AuthError> {
        let resp: CreateAuthUriResponse = self
            .post(
                "createAuthUri",
                &CreateAuthUriRequest {
                    identifier: email,
                    continue_uri: REQUEST_URI,
                },
            )
            .await?;
        Ok(resp.signin_methods)
    }

    #[tracing::instrument(skip(self), err)]
    async fn link_with_credential(&self, credential: &Credential) -> Result<AuthAccount, AuthError> {
        let current = self
            .current
            .read()
            .await
            .clone()
            .ok_or(AuthError::NotSignedIn)?;
        let linked = self
            .sign_in_with_idp(credential, Some(&current.id_token))
            .await?;

        let mut providers = current.providers.clone();
        for p in linked.providers {
            if !providers.contains(&p) {
                providers.push(p);
            }
        }
        let merged = SignedIn {
            uid: current.uid,
            id_token: linked.id_token,
            email: current.email.or(linked.email),
            display_name: current.display_name.or(linked.display_name),
            photo_url: current.photo_url.or(linked.photo_url),
            providers,
        };
        *self.current.write().await = Some(merged.clone());
        Ok(merged.into())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        *self.current.write().await = None;
        Ok(())
    }
}
