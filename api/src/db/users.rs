use chrono::NaiveDate;
use serde_json::{Value, json};

use super::document::{DocPath, FieldOp, Patch, Query, Write};
use super::models::{ProfileField, SignInProfile, User};
use super::{DbError, DocumentStore, USERS, decode_all};
use crate::types::UserId;

fn user_path(id: &UserId) -> DocPath {
    DocPath::new(USERS, id.as_str())
}

#[tracing::instrument(skip(store), err)]
pub async fn get_user(store: &dyn DocumentStore, id: &UserId) -> Result<Option<User>, DbError> {
    match store.get(&user_path(id)).await? {
        Some(doc) => Ok(Some(doc.decode::<User>()?)),
        None => Ok(None),
    }
}

async fn require_user(store: &dyn DocumentStore, id: &UserId) -> Result<User, DbError> {
    get_user(store, id)
        .await?
        .ok_or_else(|| DbError::NotFound(user_path(id).to_string()))
}

#[tracing::instrument(skip(store), err)]
pub async fn get_all_users(store: &dyn DocumentStore) -> Result<Vec<User>, DbError> {
    let docs = store.query(&Query::collection(USERS)).await?;
    decode_all(docs)
}

#[tracing::instrument(skip(store), err)]
pub async fn get_all_users_except(
    store: &dyn DocumentStore,
    id: &UserId,
) -> Result<Vec<User>, DbError> {
    let mut users = get_all_users(store).await?;
    users.retain(|u| &u.id != id);
    Ok(users)
}

/// 表示名の前方一致（大文字小文字を区別しない）で検索する
#[tracing::instrument(skip(store), err)]
pub async fn search_users(
    store: &dyn DocumentStore,
    except: &UserId,
    prefix: &str,
) -> Result<Vec<User>, DbError> {
    let prefix = prefix.trim().to_lowercase();
    let mut users = get_all_users_except(store, except).await?;
    users.retain(|u| u.display_name.to_lowercase().starts_with(&prefix));
    Ok(users)
}

/// フォロワーのユーザ一覧。削除済みなど解決できないIDは含めない。
#[tracing::instrument(skip(store), err)]
pub async fn get_followers(store: &dyn DocumentStore, id: &UserId) -> Result<Vec<User>, DbError> {
    let user = require_user(store, id).await?;
    resolve_all(store, &user.followers).await
}

#[tracing::instrument(skip(store), err)]
pub async fn get_following(store: &dyn DocumentStore, id: &UserId) -> Result<Vec<User>, DbError> {
    let user = require_user(store, id).await?;
    resolve_all(store, &user.following).await
}

async fn resolve_all(store: &dyn DocumentStore, ids: &[UserId]) -> Result<Vec<User>, DbError> {
    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(user) = get_user(store, id).await? {
            users.push(user);
        }
    }
    Ok(users)
}

/// サインイン時にユーザドキュメントを作成、または既存のものを更新する。
/// 表示名とアイコンはプロフィール編集を上書きしないよう未設定時のみ書き込む。
#[tracing::instrument(skip(store), err)]
pub async fn record_sign_in(
    store: &dyn DocumentStore,
    profile: &SignInProfile,
) -> Result<User, DbError> {
    let mut patch = Patch::new()
        .set("id", profile.id.as_str())
        .set("email", profile.email.as_str())
        .op(
            "displayName",
            FieldOp::SetIfMissing(Value::String(profile.display_name.clone())),
        )
        .set("providerId", profile.provider_id.as_str())
        .op("followers", FieldOp::ArrayUnion(Vec::new()))
        .op("following", FieldOp::ArrayUnion(Vec::new()))
        .op("labels", FieldOp::ArrayUnion(Vec::new()))
        .op("createdAt", FieldOp::ServerTimestampOnCreate)
        .server_timestamp("updatedAt");
    if let Some(photo) = &profile.photo_url {
        patch = patch.op("photoURL", FieldOp::SetIfMissing(Value::String(photo.clone())));
    }
    if let Some(token) = &profile.fcm_token {
        patch = patch.set("fcmToken", token.as_str());
    }

    super::write(
        store,
        Write::Merge {
            path: user_path(&profile.id),
            patch,
        },
    )
    .await?;
    require_user(store, &profile.id).await
}

/// ユーザドキュメント上の最新プッシュトークンを更新する
#[tracing::instrument(skip(store, token), err)]
pub async fn update_fcm_token(
    store: &dyn DocumentStore,
    id: &UserId,
    token: &str,
) -> Result<(), DbError> {
    super::write(
        store,
        Write::Update {
            path: user_path(id),
            patch: Patch::new()
                .set("fcmToken", token)
                .server_timestamp("updatedAt"),
        },
    )
    .await
}

fn follow_writes(current: &UserId, target: &UserId, follow: bool) -> Result<Vec<Write>, DbError> {
    if current == target {
        return Err(DbError::Invalid(format!("{current} cannot follow themselves")));
    }
    let op = |id: &UserId| {
        let values = vec![json!(id.as_str())];
        if follow {
            FieldOp::ArrayUnion(values)
        } else {
            FieldOp::ArrayRemove(values)
        }
    };
    Ok(vec![
        Write::Update {
            path: user_path(current),
            patch: Patch::new()
                .op("following", op(target))
                .server_timestamp("updatedAt"),
        },
        Write::Update {
            path: user_path(target),
            patch: Patch::new()
                .op("followers", op(current))
                .server_timestamp("updatedAt"),
        },
    ])
}

/// `current` が `target` をフォローする。両ドキュメントの更新は1コミットで行う。
/// 更新後の `current` を返す。
#[tracing::instrument(skip(store), err)]
pub async fn follow_user(
    store: &dyn DocumentStore,
    current: &UserId,
    target: &UserId,
) -> Result<User, DbError> {
    store.commit(follow_writes(current, target, true)?).await?;
    require_user(store, current).await
}

#[tracing::instrument(skip(store), err)]
pub async fn unfollow_user(
    store: &dyn DocumentStore,
    current: &UserId,
    target: &UserId,
) -> Result<User, DbError> {
    store.commit(follow_writes(current, target, false)?).await?;
    require_user(store, current).await
}

/// 指定フィールドのみを更新する。生年月日だけが渡された場合は年齢も算出して書き込む。
#[tracing::instrument(skip(store), err)]
pub async fn update_profile(
    store: &dyn DocumentStore,
    id: &UserId,
    fields: &[ProfileField],
    today: NaiveDate,
) -> Result<User, DbError> {
    if fields.is_empty() {
        return require_user(store, id).await;
    }

    let mut patch = Patch::new();
    for field in fields {
        patch = patch.set(field.field_name(), field.value());
    }

    let has_age = fields.iter().any(|f| matches!(f, ProfileField::Age(_)));
    let dob = fields.iter().find_map(|f| match f {
        ProfileField::Dob(dob) => Some(dob.as_str()),
        _ => None,
    });
    if let Some(dob) = dob
        && !has_age
    {
        let age = refresh_common::dates::calculate_age(dob, today)
            .map_err(|e| DbError::Invalid(e.to_string()))?;
        patch = patch.set("age", age);
    }

    super::write(
        store,
        Write::Update {
            path: user_path(id),
            patch: patch.server_timestamp("updatedAt"),
        },
    )
    .await?;
    require_user(store, id).await
}
