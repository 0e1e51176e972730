// src/memory/storage/milvus.rs

//! Milvus backend over its v2 REST surface. Follows the same
//! request/response discipline as the rest of the crate's HTTP clients:
//! non-2xx is an error, and the envelope's `code` field must be zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::memory::storage::schema::{CollectionSchema, FieldType};
use crate::memory::traits::VectorStore;
use crate::memory::types::{DeleteOutcome, InsertOutcome, MemoryRecord};

pub struct MilvusHttpStore {
    client: Client,
    base_url: String,
    connected: AtomicBool,
}

impl MilvusHttpStore {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connected: AtomicBool::new(false),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.post_with_timeout(path, body, None).await
    }

    async fn post_with_timeout(
        &self,
        path: &str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Milvus request to {} failed", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Milvus HTTP error {} on {}: {}", status, path, error_text));
        }

        let envelope: Value = response
            .json()
            .await
            .with_context(|| format!("Milvus response from {} is not JSON", path))?;

        let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("Milvus operation {} failed (code {}): {}", path, code, message));
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    fn schema_payload(schema: &CollectionSchema) -> Value {
        let fields: Vec<Value> = schema
            .fields
            .iter()
            .map(|field| {
                let (data_type, params) = match &field.field_type {
                    FieldType::Int64 => ("Int64", json!({})),
                    FieldType::VarChar { max_length } => {
                        ("VarChar", json!({"max_length": max_length.to_string()}))
                    }
                    FieldType::FloatVector { dim } => {
                        ("FloatVector", json!({"dim": dim.to_string()}))
                    }
                };
                json!({
                    "fieldName": field.name,
                    "dataType": data_type,
                    "isPrimary": field.is_primary,
                    "autoID": field.auto_id,
                    "elementTypeParams": params,
                })
            })
            .collect();

        json!({
            "autoID": schema.fields.iter().any(|f| f.auto_id),
            "fields": fields,
        })
    }
}

#[async_trait]
impl VectorStore for MilvusHttpStore {
    async fn connect(&self) -> Result<()> {
        // A list call doubles as the connectivity probe.
        self.post("/v2/vectordb/collections/list", json!({})).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to Milvus at {}", self.base_url);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        let data = self
            .post("/v2/vectordb/collections/has", json!({"collectionName": name}))
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn create_collection(&self, name: &str, schema: &CollectionSchema) -> Result<()> {
        let payload = json!({
            "collectionName": name,
            "schema": Self::schema_payload(schema),
        });
        self.post("/v2/vectordb/collections/create", payload).await?;
        info!("Created Milvus collection '{}'", name);
        Ok(())
    }

    async fn create_index(
        &self,
        name: &str,
        field: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<()> {
        let metric_type = params
            .get("metric_type")
            .and_then(Value::as_str)
            .unwrap_or("L2");
        let index_type = params
            .get("index_type")
            .and_then(Value::as_str)
            .unwrap_or("AUTOINDEX");
        let extra = params.get("params").cloned().unwrap_or_else(|| json!({}));

        let payload = json!({
            "collectionName": name,
            "indexParams": [{
                "fieldName": field,
                "indexName": format!("{}_idx", field),
                "metricType": metric_type,
                "indexType": index_type,
                "params": extra,
            }],
        });
        self.post_with_timeout("/v2/vectordb/indexes/create", payload, Some(timeout))
            .await?;
        debug!("Created index on '{}.{}'", name, field);
        Ok(())
    }

    async fn load_collection(&self, name: &str) -> Result<()> {
        self.post("/v2/vectordb/collections/load", json!({"collectionName": name}))
            .await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let data = self.post("/v2/vectordb/collections/list", json!({})).await?;
        Ok(data
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, name: &str, records: Vec<MemoryRecord>) -> Result<InsertOutcome> {
        let data: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "personality_id": record.personality_id,
                    "session_id": record.session_id,
                    "content": record.content,
                    "vector": record.vector,
                    "create_time": record.create_time,
                })
            })
            .collect();

        let response = self
            .post(
                "/v2/vectordb/entities/insert",
                json!({"collectionName": name, "data": data}),
            )
            .await?;

        Ok(InsertOutcome {
            inserted: response
                .get("insertCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            ids: response
                .get("insertIds")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default(),
        })
    }

    async fn query(
        &self,
        name: &str,
        filter: &str,
        output_fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Value>> {
        let data = self
            .post(
                "/v2/vectordb/entities/query",
                json!({
                    "collectionName": name,
                    "filter": filter,
                    "outputFields": output_fields,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn search(
        &self,
        name: &str,
        vectors: Vec<Vec<f32>>,
        vector_field: &str,
        search_params: &Value,
        limit: usize,
        filter: &str,
        output_fields: &[&str],
    ) -> Result<Vec<Vec<Value>>> {
        // One request per query vector keeps the per-query hit grouping
        // unambiguous across server versions.
        let mut per_query = Vec::with_capacity(vectors.len());
        for vector in &vectors {
            let data = self
                .post(
                    "/v2/vectordb/entities/search",
                    json!({
                        "collectionName": name,
                        "data": [vector],
                        "annsField": vector_field,
                        "filter": filter,
                        "limit": limit,
                        "outputFields": output_fields,
                        "searchParams": search_params,
                    }),
                )
                .await?;
            per_query.push(data.as_array().cloned().unwrap_or_default());
        }
        Ok(per_query)
    }

    async fn delete(&self, name: &str, filter: &str) -> Result<DeleteOutcome> {
        let data = self
            .post(
                "/v2/vectordb/entities/delete",
                json!({"collectionName": name, "filter": filter}),
            )
            .await?;
        Ok(DeleteOutcome {
            deleted: data.get("deleteCount").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    async fn flush(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.post(
                "/v2/vectordb/collections/flush",
                json!({"collectionName": name}),
            )
            .await?;
        }
        Ok(())
    }
}
