use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use refresh_api::config::AppConfig;
use refresh_api::db::{self, SqliteStore, Store};
use refresh_api::error::AppError;
use refresh_api::events::EventBus;
use refresh_api::identity::firebase::FirebaseAuth;
use refresh_api::identity::memory::{MemoryAuthBackend, StaticCredentials, StaticPushRegistrar};
use refresh_api::identity::{AuthBackend, IdentityStore};
use refresh_api::push::{Dispatcher, FcmSender, LogSender, PushSender};
use refresh_api::session::{FileSessionCache, Session};
use refresh_api::storage::{LocalMedia, MediaUploader, RetryPolicy, S3Storage};
use refresh_api::types::{ThreadId, UserId};
use refresh_api::{AppState, SocialClient};

#[derive(Parser)]
#[command(name = "refresh", about = "Operator tool for the Refresh social data store", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all users
    Users,
    /// Show one user
    User { id: String },
    /// Make <me> follow <target>
    Follow { me: String, target: String },
    /// Make <me> unfollow <target>
    Unfollow { me: String, target: String },
    /// List posts, newest first
    Posts {
        #[arg(long)]
        user: Option<String>,
    },
    /// Upload a local file and print its public URL
    Upload {
        path: String,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Send a text message
    Send { from: String, to: String, text: String },
    /// List messages between two users, newest first
    Messages { a: String, b: String },
    /// Show a user's inbox
    Inbox { user: String },
    /// Show the cached session user
    Session,
}

fn user_id(s: &str) -> Result<UserId, AppError> {
    UserId::validate(s).map_err(AppError::BadRequest)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| AppError::Internal(e.to_string()))?;
    println!("{json}");
    Ok(())
}

async fn run(client: &SocialClient, command: Command) -> Result<(), AppError> {
    match command {
        Command::Users => print_json(&client.get_all_users().await?),
        Command::User { id } => match client.get_user(&user_id(&id)?).await? {
            Some(user) => print_json(&user),
            None => Err(AppError::NotFound(format!("user {id}"))),
        },
        Command::Follow { me, target } => {
            print_json(&client.follow_user(&user_id(&me)?, &user_id(&target)?).await?)
        }
        Command::Unfollow { me, target } => {
            print_json(&client.unfollow_user(&user_id(&me)?, &user_id(&target)?).await?)
        }
        Command::Posts { user: Some(user) } => {
            print_json(&client.get_posts_by_user(&user_id(&user)?).await?)
        }
        Command::Posts { user: None } => print_json(&client.get_all_posts().await?),
        Command::Upload { path, content_type } => {
            let mut media = LocalMedia::new(&path);
            if let Some(file_name) = std::path::Path::new(&path).file_name() {
                media = media.with_file_name(file_name.to_string_lossy());
            }
            if let Some(content_type) = content_type {
                media = media.with_content_type(content_type);
            }
            let uploaded = client.upload_media(&media).await?;
            println!("{}", uploaded.url);
            Ok(())
        }
        Command::Send { from, to, text } => {
            let from = user_id(&from)?;
            let sender = client
                .get_user(&from)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("user {from}")))?;
            let (receiver, _) = client.chat_with(&from, &user_id(&to)?).await?;
            print_json(&client.send_text(&sender, &receiver, &text).await?)
        }
        Command::Messages { a, b } => {
            let thread = ThreadId::between(&user_id(&a)?, &user_id(&b)?);
            print_json(&client.get_messages(&thread).await?)
        }
        Command::Inbox { user } => print_json(&client.get_inbox(&user_id(&user)?).await?),
        Command::Session => print_json(&client.current_user()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("refresh_api=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    tracing::debug!("using database {}", config.database_url);

    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;
    let store: Store = Arc::new(SqliteStore::new(pool));

    let storage = Arc::new(S3Storage::new(&config).await);
    let uploader = Arc::new(MediaUploader::new(storage, RetryPolicy::from_config(&config)));
    let events = EventBus::default();

    let sender: Arc<dyn PushSender> = match (&config.fcm_project_id, &config.fcm_access_token) {
        (Some(project), Some(token)) => Arc::new(FcmSender::new(project, token.clone())),
        _ => {
            tracing::info!("FCM is not configured; notifications are only logged");
            Arc::new(LogSender)
        }
    };
    let dispatcher = Dispatcher::new(store.clone(), sender).spawn(events.subscribe());

    // CLI からはサインインしないため、資格情報と通知権限は空のまま
    let backend: Arc<dyn AuthBackend> = match &config.firebase_api_key {
        Some(key) => Arc::new(FirebaseAuth::new(key.clone())),
        None => Arc::new(MemoryAuthBackend::new()),
    };
    let session = Session::new(Arc::new(FileSessionCache::new(&config.session_cache_path)));
    if let Err(e) = session.restore().await {
        tracing::warn!("ignoring unreadable session cache: {e}");
    }
    let identity = IdentityStore::new(
        store.clone(),
        Arc::new(StaticCredentials::new()),
        backend,
        Arc::new(StaticPushRegistrar::denied(&config.device_type)),
        session,
        events.clone(),
    );

    let client = SocialClient::new(
        AppState {
            store,
            config,
            uploader,
            events,
        },
        identity,
    );
    let result = run(&client, cli.command).await;

    // 送信側をすべて閉じ、残っている通知を配送し終えるまで待つ
    drop(client);
    dispatcher.await?;

    result.map_err(Into::into)
}
