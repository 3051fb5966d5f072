use crate::error::RefreshError;

/// スレッドIDの区切り文字
pub const THREAD_ID_SEPARATOR: char = '_';

/// 2ユーザ間のチャットスレッドIDを導出する。
///
/// `min(a, b) + "_" + max(a, b)` なので、どちらの端末が計算しても
/// 調整なしに同じIDになる。
pub fn thread_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}{THREAD_ID_SEPARATOR}{hi}")
}

/// 参加者リストから `me` 以外の参加者を返す。見つからなければ `None`。
pub fn other_participant<'a, S: AsRef<str>>(participants: &'a [S], me: &str) -> Option<&'a str> {
    participants
        .iter()
        .map(AsRef::as_ref)
        .find(|id| *id != me)
}

/// ドキュメントIDやマップキーとして使える識別子かを検証する。
/// `/` はコレクションパス、`.` はフィールドパスの区切りなので禁止。
pub fn validate_segment(s: &str) -> Result<(), RefreshError> {
    if s.is_empty() {
        return Err(RefreshError::InvalidId("identifier must not be empty".into()));
    }
    if s.contains('/') || s.contains('.') {
        return Err(RefreshError::InvalidId(format!(
            "identifier must not contain '/' or '.': {s}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_symmetric() {
        let pairs = [
            ("u1", "u2"),
            ("zeta", "alpha"),
            ("abc", "abd"),
            ("A", "a"),
            ("same", "same"),
        ];
        for (a, b) in pairs {
            assert_eq!(thread_id(a, b), thread_id(b, a));
        }
    }

    #[test]
    fn thread_id_sorts_then_joins() {
        assert_eq!(thread_id("u2", "u1"), "u1_u2");
        assert_eq!(thread_id("bob", "alice"), "alice_bob");
    }

    #[test]
    fn other_participant_by_difference() {
        let participants = vec!["u1".to_string(), "u2".to_string()];
        assert_eq!(other_participant(&participants, "u1"), Some("u2"));
        assert_eq!(other_participant(&participants, "u2"), Some("u1"));
        assert_eq!(other_participant(&["u1", "u1"], "u1"), None);
    }

    #[test]
    fn segment_validation() {
        assert!(validate_segment("Xk2fP9").is_ok());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("a.b").is_err());
    }
}
