pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod identity;
pub mod push;
pub mod session;
pub mod storage;
pub mod types;

use std::sync::Arc;

use config::AppConfig;
use events::EventBus;
use storage::MediaUploader;

pub use client::SocialClient;

/// Application state shared by the client, the identity store and the CLI.
#[derive(Clone)]
pub struct AppState {
    pub store: db::Store,
    pub config: AppConfig,
    pub uploader: Arc<MediaUploader>,
    pub events: EventBus,
}
