use serde::{Deserialize, Serialize};

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// ランダムなID（ハイフンなしUUID v4）を生成する
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// ドキュメントID・マップキーとして使える形式か検証する
            pub fn validate(s: &str) -> Result<Self, String> {
                refresh_common::chat::validate_segment(s).map_err(|e| e.to_string())?;
                Ok(Self(s.to_string()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_id!(UserId);
newtype_id!(PostId);
newtype_id!(CommentId);
newtype_id!(MessageId);
newtype_id!(ThreadId);

impl ThreadId {
    /// 2ユーザ間のスレッドID。引数の順序に依存しない。
    pub fn between(a: &UserId, b: &UserId) -> Self {
        Self(refresh_common::chat::thread_id(a.as_str(), b.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_between_is_symmetric() {
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        assert_eq!(ThreadId::between(&a, &b), ThreadId::between(&b, &a));
        assert_eq!(ThreadId::between(&a, &b).as_str(), "u1_u2");
    }

    #[test]
    fn validate_rejects_path_separators() {
        assert!(UserId::validate("u1").is_ok());
        assert!(UserId::validate("").is_err());
        assert!(UserId::validate("users/u1").is_err());
        assert!(PostId::validate("p.1").is_err());
    }

    #[test]
    fn new_v4_is_a_valid_segment() {
        let id = CommentId::new_v4();
        assert!(CommentId::validate(id.as_str()).is_ok());
        assert_eq!(id.as_str().len(), 32);
    }
}
