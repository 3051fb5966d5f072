use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};

use super::{Notification, PushError, PushSender};

const FCM_BASE_URL: &str = "https://fcm.googleapis.com/v1";

pub struct FcmSender {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl FcmSender {
    pub fn new(project_id: &str, access_token: impl Into<String>) -> Self {
        Self::with_base_url(FCM_BASE_URL, project_id, access_token)
    }

    pub fn with_base_url(base_url: &str, project_id: &str, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/projects/{}/messages:send",
                base_url.trim_end_matches('/'),
                urlencoding::encode(project_id)
            ),
            access_token: access_token.into(),
        }
    }
}

/// カテゴリは Android では click_action、iOS では aps.category として渡す
fn message_body(token: &str, notification: &Notification) -> Value {
    let category = notification.category.id();
    let mut data = notification.data.clone();
    data.insert("category".into(), category.into());

    let mut body = json!({
        "title": notification.title,
        "body": notification.body,
    });
    if let Some(image) = &notification.image {
        body["image"] = json!(image);
    }

    json!({
        "message": {
            "token": token,
            "notification": body,
            "data": data,
            "android": { "notification": { "click_action": category } },
            "apns": { "payload": { "aps": { "category": category } } },
        }
    })
}

fn classify(status: StatusCode, body: &str) -> PushError {
    if status == StatusCode::NOT_FOUND || body.contains("UNREGISTERED") {
        PushError::Unregistered
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PushError::Transient(format!("fcm returned {status}"))
    } else {
        PushError::Rejected(format!("fcm returned {status}: {body}"))
    }
}

#[async_trait]
impl PushSender for FcmSender {
    async fn send(&self, token: &str, notification: &Notification) -> Result<(), PushError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&message_body(token, notification))
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}
