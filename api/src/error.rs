use refresh_common::error::ErrorKind;

use crate::db::DbError;
use crate::identity::AuthError;
use crate::storage::StorageError;

/// 呼び出し側に返すエラー。各レイヤのエラーはここで分類される。
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("this email is already associated with {}. Please sign in with {}", .methods.join(", "), .methods.first().map(String::as_str).unwrap_or("another provider"))]
    AuthConflict { email: String, methods: Vec<String> },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("temporarily unavailable: {0}")]
    Transient(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::AuthConflict { .. } => ErrorKind::AuthConflict,
            AppError::PermissionDenied(_) | AppError::Unauthorized(_) => ErrorKind::PermissionDenied,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Transient(_) => ErrorKind::Transient,
            AppError::BadRequest(_) | AppError::Internal(_) => ErrorKind::Unknown,
        }
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(path) => AppError::NotFound(path),
            DbError::Invalid(msg) => AppError::BadRequest(msg),
            DbError::Sqlx(
                err @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)),
            ) => {
                tracing::debug!("database error: {err}");
                AppError::Transient("database unavailable".into())
            }
            DbError::Sqlx(sqlx::Error::Database(err)) if is_busy(err.as_ref()) => {
                tracing::debug!("database error: {err}");
                AppError::Transient("database unavailable".into())
            }
            other => {
                tracing::debug!("database error: {other}");
                AppError::Internal("database error".into())
            }
        }
    }
}

/// SQLITE_BUSY (5) と SQLITE_LOCKED (6)。拡張コードは下位8ビットが基本コード。
fn is_busy(err: &dyn sqlx::error::DatabaseError) -> bool {
    err.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Transient(msg) => AppError::Transient(msg),
            StorageError::NotFound(key) => AppError::NotFound(key),
            StorageError::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                AppError::PermissionDenied(err.to_string())
            }
            StorageError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                AppError::NotFound(err.to_string())
            }
            other => {
                tracing::debug!("storage error: {other}");
                AppError::Internal(other.to_string())
            }
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::AccountExistsWithDifferentCredential { email } => AppError::AuthConflict {
                email,
                methods: Vec::new(),
            },
            AuthError::Cancelled => AppError::Unauthorized("sign-in was cancelled".into()),
            AuthError::InvalidCredential(msg) => AppError::Unauthorized(msg),
            AuthError::Network(msg) => AppError::Transient(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}
