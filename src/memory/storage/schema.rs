// src/memory/storage/schema.rs

//! Backend-agnostic collection schema. Both backends consume this generic
//! field-descriptor list; neither backend's native schema type leaks into
//! shared code.

use serde::{Deserialize, Serialize};

use crate::memory::types::{
    MAX_CONTENT_LEN, MAX_PERSONA_LEN, MAX_SESSION_ID_LEN, PRIMARY_FIELD, VECTOR_FIELD,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Int64,
    VarChar { max_length: usize },
    FloatVector { dim: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub auto_id: bool,
}

impl FieldSchema {
    pub fn int64(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Int64,
            is_primary: false,
            auto_id: false,
        }
    }

    pub fn varchar(name: &str, max_length: usize) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::VarChar { max_length },
            is_primary: false,
            auto_id: false,
        }
    }

    pub fn float_vector(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::FloatVector { dim },
            is_primary: false,
            auto_id: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_auto_id(mut self) -> Self {
        self.auto_id = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub description: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// The canonical memory-record schema. The vector dimension is fixed
    /// here, at collection-creation time; inserts are not re-validated.
    pub fn memory_collection(dim: usize) -> Self {
        Self {
            description: "Long-term conversational memory".to_string(),
            fields: vec![
                FieldSchema::int64(PRIMARY_FIELD).primary().with_auto_id(),
                FieldSchema::varchar("personality_id", MAX_PERSONA_LEN),
                FieldSchema::varchar("session_id", MAX_SESSION_ID_LEN),
                FieldSchema::varchar("content", MAX_CONTENT_LEN),
                FieldSchema::float_vector(VECTOR_FIELD, dim),
                FieldSchema::int64("create_time"),
            ],
        }
    }

    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary)
    }

    pub fn vector_dim(&self) -> Option<usize> {
        self.fields.iter().find_map(|f| match f.field_type {
            FieldType::FloatVector { dim } => Some(dim),
            _ => None,
        })
    }
}
