#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

/// 呼び出し側がリトライ/アラート方針を機械的に決めるためのエラー分類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 同じメールアドレスが別プロバイダに紐付いている
    AuthConflict,
    /// カメラ・ストレージ・通知などの権限が拒否された
    PermissionDenied,
    NotFound,
    /// ネットワーク断やバックエンドの一時的な失敗
    Transient,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// ユーザ向けアラートを出すべきか。権限拒否は操作のキャンセル扱い。
    pub fn should_alert(self) -> bool {
        !matches!(self, ErrorKind::PermissionDenied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthConflict => "auth_conflict",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
