use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use super::document::{DocPath, Document, Fields, Query, ServerClock, Write, apply_write};
use super::{DbError, DocumentStore};

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

/// プロセス内のドキュメントストア。コミットは一旦別領域に積み、全件成功した時だけ反映する。
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    clock: ServerClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, DbError> {
        let collections = self.collections.read().map_err(|_| DbError::Poisoned)?;
        Ok(collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .map(|data| Document {
                id: path.id.clone(),
                data: data.clone(),
            }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, DbError> {
        let collections = self.collections.read().map_err(|_| DbError::Poisoned)?;
        let docs = collections
            .get(&query.collection)
            .into_iter()
            .flatten()
            .map(|(id, data)| Document {
                id: id.clone(),
                data: data.clone(),
            });
        Ok(query.run(docs))
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), DbError> {
        let now = self.clock.now()?;
        let mut collections = self.collections.write().map_err(|_| DbError::Poisoned)?;

        let mut staged: HashMap<DocPath, Option<Fields>> = HashMap::new();
        for write in &writes {
            let path = write.path();
            let current = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => collections
                    .get(&path.collection)
                    .and_then(|docs| docs.get(&path.id))
                    .cloned(),
            };
            let next = apply_write(current, write, &now)?;
            staged.insert(path.clone(), next);
        }

        for (path, doc) in staged {
            match doc {
                Some(fields) => {
                    collections
                        .entry(path.collection)
                        .or_default()
                        .insert(path.id, fields);
                }
                None => {
                    if let Some(docs) = collections.get_mut(&path.collection) {
                        docs.remove(&path.id);
                    }
                }
            }
        }
        Ok(())
    }
}
