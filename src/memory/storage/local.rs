// src/memory/storage/local.rs

//! In-process vector store: brute-force scored search over JSON-persisted
//! collections. Fills the same contract as the Milvus backend for
//! deployments without a vector database, and doubles as the test backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::llm::embeddings::utils::cosine_similarity;
use crate::memory::storage::schema::CollectionSchema;
use crate::memory::traits::VectorStore;
use crate::memory::types::{DeleteOutcome, InsertOutcome, MemoryRecord, PRIMARY_FIELD};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalRecord {
    fields: Map<String, Value>,
    vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalCollection {
    schema: CollectionSchema,
    next_id: i64,
    records: Vec<LocalRecord>,
}

pub struct LocalVectorStore {
    collections: RwLock<HashMap<String, LocalCollection>>,
    data_dir: Option<PathBuf>,
    connected: AtomicBool,
}

impl LocalVectorStore {
    /// `data_dir = None` keeps everything in memory (tests); otherwise
    /// collections persist as one JSON file each under the directory.
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            data_dir,
            connected: AtomicBool::new(false),
        }
    }

    fn collection_path(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(format!("{}.json", name)))
    }

    async fn persist(&self, name: &str) -> Result<()> {
        let Some(path) = self.collection_path(name) else {
            return Ok(());
        };
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(name) else {
            // Deleted collections lose their file.
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(());
        };
        let bytes = serde_json::to_vec(collection)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to persist collection '{}'", name))?;
        Ok(())
    }

    async fn load_from_disk(&self) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        if !dir.exists() {
            tokio::fs::create_dir_all(dir).await?;
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut collections = self.collections.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<LocalCollection>(&bytes) {
                    Ok(collection) => {
                        info!(
                            "Loaded local collection '{}' ({} records)",
                            name,
                            collection.records.len()
                        );
                        collections.insert(name.to_string(), collection);
                    }
                    Err(e) => warn!("Skipping unreadable collection file {:?}: {}", path, e),
                },
                Err(e) => warn!("Skipping collection file {:?}: {}", path, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn connect(&self) -> Result<()> {
        self.load_from_disk().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        let names: Vec<String> = {
            let collections = self.collections.read().await;
            collections.keys().cloned().collect()
        };
        for name in names {
            self.persist(&name).await?;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        let collections = self.collections.read().await;
        Ok(collections.contains_key(name))
    }

    async fn create_collection(&self, name: &str, schema: &CollectionSchema) -> Result<()> {
        // The dimension invariant is enforced here, once, not per insert.
        let dim = schema
            .vector_dim()
            .ok_or_else(|| anyhow!("Collection schema '{}' carries no vector field", name))?;
        if dim == 0 {
            return Err(anyhow!("Collection schema '{}' has a zero-dim vector", name));
        }

        let mut collections = self.collections.write().await;
        if collections.contains_key(name) {
            debug!("Collection '{}' already exists", name);
            return Ok(());
        }
        collections.insert(
            name.to_string(),
            LocalCollection {
                schema: schema.clone(),
                next_id: 1,
                records: Vec::new(),
            },
        );
        drop(collections);
        self.persist(name).await?;
        info!("Created local collection '{}' (dim {})", name, dim);
        Ok(())
    }

    async fn create_index(
        &self,
        name: &str,
        field: &str,
        _params: &Value,
        _timeout: Duration,
    ) -> Result<()> {
        // Brute-force scan; the index request just validates the target.
        let collections = self.collections.read().await;
        if !collections.contains_key(name) {
            return Err(anyhow!("Cannot index unknown collection '{}'", name));
        }
        debug!("Local backend ignores index creation for '{}.{}'", name, field);
        Ok(())
    }

    async fn load_collection(&self, name: &str) -> Result<()> {
        let collections = self.collections.read().await;
        if !collections.contains_key(name) {
            return Err(anyhow!("Cannot load unknown collection '{}'", name));
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().await;
        Ok(collections.keys().cloned().collect())
    }

    async fn insert(&self, name: &str, records: Vec<MemoryRecord>) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| anyhow!("Insert into unknown collection '{}'", name))?;

        for record in records {
            let id = collection.next_id;
            collection.next_id += 1;

            let mut fields = Map::new();
            fields.insert(PRIMARY_FIELD.to_string(), json!(id));
            fields.insert("personality_id".to_string(), json!(record.personality_id));
            fields.insert("session_id".to_string(), json!(record.session_id));
            fields.insert("content".to_string(), json!(record.content));
            fields.insert("create_time".to_string(), json!(record.create_time));

            collection.records.push(LocalRecord {
                fields,
                vector: record.vector,
            });
            outcome.inserted += 1;
            outcome.ids.push(id);
        }
        Ok(outcome)
    }

    async fn query(
        &self,
        name: &str,
        filter: &str,
        output_fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| anyhow!("Query against unknown collection '{}'", name))?;

        Ok(collection
            .records
            .iter()
            .filter(|r| matches_filter(&r.fields, filter))
            .take(limit)
            .map(|r| project_fields(&r.fields, output_fields))
            .collect())
    }

    async fn search(
        &self,
        name: &str,
        vectors: Vec<Vec<f32>>,
        _vector_field: &str,
        _search_params: &Value,
        limit: usize,
        filter: &str,
        output_fields: &[&str],
    ) -> Result<Vec<Vec<Value>>> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| anyhow!("Search against unknown collection '{}'", name))?;

        let mut per_query = Vec::with_capacity(vectors.len());
        for query_vector in &vectors {
            let mut scored: Vec<(f32, &LocalRecord)> = collection
                .records
                .iter()
                .filter(|r| matches_filter(&r.fields, filter))
                .map(|r| (cosine_similarity(query_vector, &r.vector), r))
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            per_query.push(
                scored
                    .into_iter()
                    .take(limit)
                    .map(|(score, record)| {
                        let mut hit = project_fields(&record.fields, output_fields);
                        if let Some(map) = hit.as_object_mut() {
                            map.insert("distance".to_string(), json!(score));
                        }
                        hit
                    })
                    .collect(),
            );
        }
        Ok(per_query)
    }

    async fn delete(&self, name: &str, filter: &str) -> Result<DeleteOutcome> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| anyhow!("Delete against unknown collection '{}'", name))?;

        let before = collection.records.len();
        collection.records.retain(|r| !matches_filter(&r.fields, filter));
        let deleted = (before - collection.records.len()) as u64;
        debug!("Deleted {} records from '{}' matching '{}'", deleted, name, filter);
        Ok(DeleteOutcome { deleted })
    }

    async fn flush(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.persist(name).await?;
        }
        Ok(())
    }
}

fn project_fields(fields: &Map<String, Value>, output_fields: &[&str]) -> Value {
    let mut out = Map::new();
    for field in output_fields {
        if let Some(value) = fields.get(*field) {
            out.insert((*field).to_string(), value.clone());
        }
    }
    Value::Object(out)
}

/// Evaluate the shared filter mini-language: conditions of the form
/// `field == "value"`, `field >= n`, `field > n`, joined with ` and `.
/// Unknown shapes match nothing.
fn matches_filter(fields: &Map<String, Value>, filter: &str) -> bool {
    let filter = filter.trim();
    if filter.is_empty() {
        return true;
    }
    filter
        .split(" and ")
        .all(|condition| eval_condition(fields, condition.trim()))
}

fn eval_condition(fields: &Map<String, Value>, condition: &str) -> bool {
    if let Some((lhs, rhs)) = condition.split_once("==") {
        let field = lhs.trim();
        let expected = rhs.trim().trim_matches('"');
        return match fields.get(field) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == expected,
            None => false,
        };
    }
    if let Some((lhs, rhs)) = condition.split_once(">=") {
        return compare_numeric(fields, lhs, rhs, |a, b| a >= b);
    }
    if let Some((lhs, rhs)) = condition.split_once('>') {
        return compare_numeric(fields, lhs, rhs, |a, b| a > b);
    }
    warn!("Unsupported filter condition '{}', matching nothing", condition);
    false
}

fn compare_numeric(
    fields: &Map<String, Value>,
    lhs: &str,
    rhs: &str,
    op: fn(f64, f64) -> bool,
) -> bool {
    let Some(actual) = fields.get(lhs.trim()).and_then(Value::as_f64) else {
        return false;
    };
    let Ok(expected) = rhs.trim().parse::<f64>() else {
        return false;
    };
    op(actual, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::VECTOR_FIELD;

    fn record(session: &str, persona: &str, content: &str, vector: Vec<f32>) -> MemoryRecord {
        MemoryRecord {
            memory_id: None,
            personality_id: persona.to_string(),
            session_id: session.to_string(),
            content: content.to_string(),
            vector,
            create_time: 1_700_000_000,
        }
    }

    async fn store_with_collection() -> LocalVectorStore {
        let store = LocalVectorStore::new(None);
        store.connect().await.unwrap();
        store
            .create_collection("mem", &CollectionSchema::memory_collection(2))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = store_with_collection().await;
        let outcome = store
            .insert(
                "mem",
                vec![
                    record("s1", "p", "a", vec![1.0, 0.0]),
                    record("s1", "p", "b", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn search_filters_by_session_and_ranks_by_similarity() {
        let store = store_with_collection().await;
        store
            .insert(
                "mem",
                vec![
                    record("s1", "p", "close", vec![1.0, 0.05]),
                    record("s1", "p", "far", vec![0.0, 1.0]),
                    record("s2", "p", "other-session", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search(
                "mem",
                vec![vec![1.0, 0.0]],
                VECTOR_FIELD,
                &json!({}),
                5,
                r#"memory_id > 0 and session_id == "s1""#,
                &["content", "session_id", PRIMARY_FIELD],
            )
            .await
            .unwrap();

        let first_query = &hits[0];
        assert_eq!(first_query.len(), 2);
        assert_eq!(first_query[0]["content"], "close");
        assert_eq!(first_query[1]["content"], "far");
        assert!(first_query.iter().all(|h| h["session_id"] == "s1"));
    }

    #[tokio::test]
    async fn delete_then_query_returns_empty_for_session() {
        let store = store_with_collection().await;
        store
            .insert(
                "mem",
                vec![
                    record("s1", "p", "a", vec![1.0, 0.0]),
                    record("s2", "p", "b", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let outcome = store.delete("mem", r#"session_id == "s1""#).await.unwrap();
        assert_eq!(outcome.deleted, 1);
        store.flush(&["mem"]).await.unwrap();

        let remaining = store
            .query("mem", r#"session_id == "s1""#, &["content"], 10)
            .await
            .unwrap();
        assert!(remaining.is_empty());

        let others = store
            .query("mem", r#"session_id == "s2""#, &["content"], 10)
            .await
            .unwrap();
        assert_eq!(others.len(), 1);
    }

    #[tokio::test]
    async fn collection_requires_vector_dim() {
        let store = LocalVectorStore::new(None);
        store.connect().await.unwrap();
        let schema = CollectionSchema {
            description: String::new(),
            fields: vec![],
        };
        assert!(store.create_collection("bad", &schema).await.is_err());
    }

    #[tokio::test]
    async fn persists_and_reloads_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalVectorStore::new(Some(dir.path().to_path_buf()));
        store.connect().await.unwrap();
        store
            .create_collection("mem", &CollectionSchema::memory_collection(2))
            .await
            .unwrap();
        store
            .insert("mem", vec![record("s1", "p", "kept", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.flush(&["mem"]).await.unwrap();

        let reopened = LocalVectorStore::new(Some(dir.path().to_path_buf()));
        reopened.connect().await.unwrap();
        assert!(reopened.has_collection("mem").await.unwrap());
        let rows = reopened.query("mem", "", &["content"], 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"], "kept");
    }
}
