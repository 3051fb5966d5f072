use std::cmp::Ordering;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::DbError;

pub type Fields = Map<String, Value>;

/// サーバタイムスタンプの書式。固定幅なので文字列順 = 時刻順になる。
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    /// `users` や `chats/<thread>/messages` のようなコレクションパス
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Fields,
}

impl Document {
    /// ドキュメント本体を型付きモデルに変換する
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DbError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| DbError::Corrupt {
            path: self.id.clone(),
            reason: e.to_string(),
        })
    }

    /// ドット区切りのフィールドパスで値を取り出す
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    /// フィールドが存在しない場合のみ設定する
    SetIfMissing(Value),
    ServerTimestamp,
    /// 作成時のみサーバタイムスタンプを設定する
    ServerTimestampOnCreate,
    /// 含まれていない要素だけを末尾に追加する（集合的追加）
    ArrayUnion(Vec<Value>),
    /// 等しい要素をすべて取り除く
    ArrayRemove(Vec<Value>),
    Increment(i64),
    Delete,
}

/// ドキュメントへのフィールド操作列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Vec<(String, FieldOp)>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSONオブジェクトのトップレベルフィールドをそれぞれ `Set` する
    pub fn from_object(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Object(map) => Ok(Self(
                map.into_iter().map(|(k, v)| (k, FieldOp::Set(v))).collect(),
            )),
            other => Err(DbError::Invalid(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn op(mut self, field: impl Into<String>, op: FieldOp) -> Self {
        self.0.push((field.into(), op));
        self
    }

    pub fn set(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, FieldOp::Set(value.into()))
    }

    pub fn server_timestamp(self, field: impl Into<String>) -> Self {
        self.op(field, FieldOp::ServerTimestamp)
    }

    pub fn ops(&self) -> &[(String, FieldOp)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// ドキュメント全体を置き換える
    Set { path: DocPath, patch: Patch },
    /// なければ作成し、指定フィールドのみ更新する
    Merge { path: DocPath, patch: Patch },
    /// 既存ドキュメントのみ更新する。存在しなければコミット全体が失敗する
    Update { path: DocPath, patch: Patch },
    Delete { path: DocPath },
}

impl Write {
    pub fn path(&self) -> &DocPath {
        match self {
            Write::Set { path, .. }
            | Write::Merge { path, .. }
            | Write::Update { path, .. }
            | Write::Delete { path } => path,
        }
    }
}

/// 1件の書き込みを現在のドキュメント本体に適用し、新しい本体を返す。
/// `None` は削除を表す。
pub fn apply_write(current: Option<Fields>, write: &Write, now: &str) -> Result<Option<Fields>, DbError> {
    let (mut fields, patch) = match write {
        Write::Delete { .. } => return Ok(None),
        Write::Set { patch, .. } => (Fields::new(), patch),
        Write::Merge { patch, .. } => (current.unwrap_or_default(), patch),
        Write::Update { path, patch } => match current {
            Some(fields) => (fields, patch),
            None => return Err(DbError::NotFound(path.to_string())),
        },
    };
    for (field, op) in patch.ops() {
        apply_op(&mut fields, field, op, now)?;
    }
    Ok(Some(fields))
}

fn apply_op(fields: &mut Fields, path: &str, op: &FieldOp, now: &str) -> Result<(), DbError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop().filter(|s| !s.is_empty()) else {
        return Err(DbError::Invalid(format!("empty field path: {path:?}")));
    };

    let mut target = fields;
    for segment in segments {
        if segment.is_empty() {
            return Err(DbError::Invalid(format!("empty field path segment: {path:?}")));
        }
        if matches!(op, FieldOp::Delete) && !target.contains_key(segment) {
            return Ok(());
        }
        let entry = target
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Fields::new()));
        if !entry.is_object() {
            if matches!(op, FieldOp::Delete) {
                return Ok(());
            }
            *entry = Value::Object(Fields::new());
        }
        target = match entry {
            Value::Object(map) => map,
            _ => unreachable!("entry was just made an object"),
        };
    }

    match op {
        FieldOp::Set(value) => {
            target.insert(leaf.to_string(), value.clone());
        }
        FieldOp::SetIfMissing(value) => {
            target
                .entry(leaf.to_string())
                .or_insert_with(|| value.clone());
        }
        FieldOp::ServerTimestamp => {
            target.insert(leaf.to_string(), Value::String(now.to_string()));
        }
        FieldOp::ServerTimestampOnCreate => {
            target
                .entry(leaf.to_string())
                .or_insert_with(|| Value::String(now.to_string()));
        }
        FieldOp::ArrayUnion(values) => {
            let mut items = take_array(target, leaf);
            for value in values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
            target.insert(leaf.to_string(), Value::Array(items));
        }
        FieldOp::ArrayRemove(values) => {
            let mut items = take_array(target, leaf);
            items.retain(|item| !values.contains(item));
            target.insert(leaf.to_string(), Value::Array(items));
        }
        FieldOp::Increment(delta) => {
            let current = target.get(leaf).and_then(Value::as_i64).unwrap_or(0);
            target.insert(leaf.to_string(), Value::from(current.saturating_add(*delta)));
        }
        FieldOp::Delete => {
            target.remove(leaf);
        }
    }
    Ok(())
}

/// 配列でない既存値は空配列として扱う
fn take_array(target: &mut Fields, leaf: &str) -> Vec<Value> {
    match target.remove(leaf) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    ArrayContains(String, Value),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, expected) => doc.field(field) == Some(expected),
            Filter::ArrayContains(field, expected) => doc
                .field(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(expected)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn where_array_contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// コレクション内の全ドキュメントにフィルタ・ソート・件数制限を適用する。
    /// 入力はID順を想定しており、ソートは安定なので同値はID順になる。
    pub fn run(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.filters.iter().all(|f| f.matches(doc)))
            .collect();
        if let Some((field, direction)) = &self.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.field(field), b.field(field));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// 欠損 < null < bool < 数値 < 文字列 < その他 の順で比較する
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// 単調増加するサーバ時刻。同一ミリ秒内のコミットも順序が付くよう1msずつ進める。
#[derive(Debug, Default)]
pub struct ServerClock {
    last_millis: Mutex<i64>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Result<String, DbError> {
        let mut last = self.last_millis.lock().map_err(|_| DbError::Poisoned)?;
        let millis = Utc::now().timestamp_millis().max(*last + 1);
        *last = millis;
        let ts = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| DbError::Invalid(format!("timestamp out of range: {millis}")))?;
        Ok(ts.format(TIMESTAMP_FORMAT).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path() -> DocPath {
        DocPath::new("users", "u1")
    }

    fn obj(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    const NOW: &str = "2024-01-01T00:00:00.000Z";

    #[test]
    fn set_replaces_whole_document() {
        let write = Write::Set {
            path: path(),
            patch: Patch::new().set("a", 1),
        };
        let out = apply_write(Some(obj(json!({"b": 2}))), &write, NOW).unwrap().unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1}));
    }

    #[test]
    fn merge_keeps_untouched_fields() {
        let write = Write::Merge {
            path: path(),
            patch: Patch::new().set("a", 1).server_timestamp("updatedAt"),
        };
        let out = apply_write(Some(obj(json!({"b": 2}))), &write, NOW).unwrap().unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1, "b": 2, "updatedAt": NOW}));
    }

    #[test]
    fn update_requires_existing_document() {
        let write = Write::Update {
            path: path(),
            patch: Patch::new().set("a", 1),
        };
        assert!(matches!(apply_write(None, &write, NOW), Err(DbError::NotFound(_))));
    }

    #[test]
    fn array_union_has_set_semantics() {
        let write = Write::Merge {
            path: path(),
            patch: Patch::new().op("following", FieldOp::ArrayUnion(vec![json!("u2"), json!("u3")])),
        };
        let start = obj(json!({"following": ["u2"]}));
        let out = apply_write(Some(start), &write, NOW).unwrap().unwrap();
        assert_eq!(out["following"], json!(["u2", "u3"]));
    }

    #[test]
    fn array_remove_drops_all_equal_values() {
        let write = Write::Merge {
            path: path(),
            patch: Patch::new().op("likes", FieldOp::ArrayRemove(vec![json!({"userId": "u1"})])),
        };
        let start = obj(json!({"likes": [{"userId": "u1"}, {"userId": "u2"}, {"userId": "u1"}]}));
        let out = apply_write(Some(start), &write, NOW).unwrap().unwrap();
        assert_eq!(out["likes"], json!([{"userId": "u2"}]));
    }

    #[test]
    fn dotted_paths_create_nested_maps() {
        let write = Write::Merge {
            path: path(),
            patch: Patch::new()
                .op("unreadCount.u2", FieldOp::Increment(1))
                .set("participantNames.u1", "Alice"),
        };
        let out = apply_write(None, &write, NOW).unwrap().unwrap();
        let again = apply_write(Some(out), &write, NOW).unwrap().unwrap();
        assert_eq!(again["unreadCount"], json!({"u2": 2}));
        assert_eq!(again["participantNames"], json!({"u1": "Alice"}));
    }

    #[test]
    fn create_timestamp_is_not_overwritten() {
        let write = Write::Merge {
            path: path(),
            patch: Patch::new().op("createdAt", FieldOp::ServerTimestampOnCreate),
        };
        let first = apply_write(None, &write, NOW).unwrap().unwrap();
        let later = apply_write(Some(first), &write, "2030-01-01T00:00:00.000Z")
            .unwrap()
            .unwrap();
        assert_eq!(later["createdAt"], json!(NOW));
    }

    #[test]
    fn query_filters_and_orders() {
        let docs = vec![
            Document { id: "a".into(), data: obj(json!({"userId": "u1", "createdAt": "2024-01-01T00:00:00.001Z"})) },
            Document { id: "b".into(), data: obj(json!({"userId": "u2", "createdAt": "2024-01-01T00:00:00.002Z"})) },
            Document { id: "c".into(), data: obj(json!({"userId": "u1", "createdAt": "2024-01-01T00:00:00.003Z"})) },
        ];
        let q = Query::collection("posts")
            .where_eq("userId", "u1")
            .order_by("createdAt", Direction::Descending);
        let ids: Vec<String> = q.run(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn query_array_contains() {
        let docs = vec![
            Document { id: "u1_u2".into(), data: obj(json!({"participants": ["u1", "u2"]})) },
            Document { id: "u2_u3".into(), data: obj(json!({"participants": ["u2", "u3"]})) },
        ];
        let q = Query::collection("chats").where_array_contains("participants", "u1");
        assert_eq!(q.run(docs).len(), 1);
    }

    #[test]
    fn server_clock_is_strictly_increasing() {
        let clock = ServerClock::new();
        let mut prev = clock.now().unwrap();
        for _ in 0..50 {
            let next = clock.now().unwrap();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }
}
