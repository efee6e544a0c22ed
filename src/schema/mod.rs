//! Schema compilation, caching, and payload validation.
//!
//! Schemas are compiled once at load time into an immutable form and kept in
//! an [`arc_swap::ArcSwap`] table so that a reload (triggered by a config
//! change or an explicit admin request) swaps in a new snapshot without
//! blocking in-flight validations against the old one.

mod cache;
mod json_schema;
mod protobuf;

pub use cache::ValidationCache;
pub use json_schema::{CompiledJsonSchema, JsonSchemaDraft};
pub use protobuf::{CompiledProtobufSchema, ProtobufSchemaError};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain_types::{SchemaId, ValidationCacheSize};

/// What a schema validates: a JSON Schema document or a protobuf message
/// type resolved within a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SchemaKind {
    /// JSON Schema, bound to a draft.
    JsonSchema,
    /// Protocol Buffers, bound to a fully-qualified message type.
    Protobuf,
}

/// How strictly a validation outcome is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Any schema violation is rejected.
    #[default]
    Strict,
    /// Unknown properties are accepted even when the schema forbids them.
    Lenient,
    /// Violations are never rejected; callers should emit a warning audit
    /// event instead and still forward the message.
    WarnOnly,
}

/// A single schema validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Stable machine-readable failure code, e.g. `schema.type_mismatch`.
    pub code: String,
    /// Human-readable detail, suitable for audit records.
    pub message: String,
    /// The failing field path within the payload, where available.
    pub path: Option<String>,
}

/// Declares where a schema's source document lives and how to compile it.
/// Read from the `validation.schema_files` configuration group.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// A JSON Schema document on disk.
    JsonSchema {
        /// The schema's id, referenced by `schema_mappings`.
        id: SchemaId,
        /// Path to the schema document.
        path: PathBuf,
        /// Draft to compile against.
        draft: JsonSchemaDraft,
    },
    /// A protobuf message type resolved within a descriptor set on disk.
    Protobuf {
        /// The schema's id, referenced by `schema_mappings`.
        id: SchemaId,
        /// Path to the compiled `FileDescriptorSet` (see `protoc --descriptor_set_out`).
        descriptor_set_path: PathBuf,
        /// Fully-qualified message type, e.g. `pkg.Message`.
        message_type: String,
    },
}

impl SchemaSource {
    fn id(&self) -> &SchemaId {
        match self {
            SchemaSource::JsonSchema { id, .. } | SchemaSource::Protobuf { id, .. } => id,
        }
    }
}

enum CompiledForm {
    JsonSchema(CompiledJsonSchema),
    Protobuf(CompiledProtobufSchema),
}

/// A schema as held by the registry: its compiled form plus the metadata
/// needed to answer `get_kind` and to report reload timestamps.
struct Schema {
    kind: SchemaKind,
    source_path: PathBuf,
    compiled: CompiledForm,
    loaded_at: DateTime<Utc>,
}

/// Errors raised loading or compiling schemas at startup or on reload.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The source document could not be read from disk.
    #[error("failed to read schema source {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The source document was not valid JSON.
    #[error("schema {schema_id} is not valid JSON: {source}")]
    InvalidJson {
        /// Offending schema id.
        schema_id: SchemaId,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The JSON Schema document itself failed to compile against its draft.
    #[error("schema {schema_id} failed to compile: {message}")]
    JsonSchemaCompile {
        /// Offending schema id.
        schema_id: SchemaId,
        /// Compiler error detail.
        message: String,
    },

    /// The protobuf descriptor set or message type was invalid.
    #[error("schema {schema_id} failed to compile: {source}")]
    ProtobufCompile {
        /// Offending schema id.
        schema_id: SchemaId,
        /// Underlying error.
        #[source]
        source: ProtobufSchemaError,
    },

    /// `validate` or `get_kind` was called with an unknown schema id.
    #[error("unknown schema id {0:?}")]
    UnknownSchemaId(SchemaId),

    /// The payload was not valid JSON and the schema is a JSON Schema.
    #[error("payload for schema {0:?} is not valid JSON")]
    PayloadNotJson(SchemaId),
}

/// Loads, compiles, caches, and validates against schemas.
///
/// The compiled-schema table lives behind an [`ArcSwap`] so that reloading a
/// schema (or the whole set) never blocks a validation already in flight
/// against the prior snapshot.
pub struct SchemaRegistry {
    schemas: ArcSwap<HashMap<SchemaId, Arc<Schema>>>,
    cache: ValidationCache,
}

impl SchemaRegistry {
    /// Builds an empty registry with the given validation cache size.
    #[must_use]
    pub fn new(cache_size: ValidationCacheSize) -> Self {
        Self {
            schemas: ArcSwap::from_pointee(HashMap::new()),
            cache: ValidationCache::new(cache_size),
        }
    }

    /// Compiles every declared schema source and installs the result as the
    /// current snapshot. On any failure, the prior snapshot (if any) is left
    /// untouched and the error is returned — at startup this means the
    /// proxy must abort, but a later reload leaves the proxy serving the
    /// last-known-good schema set.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] on the first source that fails to read or
    /// compile.
    pub fn load_all(&self, sources: &[SchemaSource]) -> Result<(), SchemaError> {
        let mut table = HashMap::with_capacity(sources.len());
        let now = Utc::now();
        for source in sources {
            let schema = compile_source(source, now)?;
            table.insert(source.id().clone(), Arc::new(schema));
        }
        for id in table.keys() {
            self.cache.invalidate_schema(id);
        }
        self.schemas.store(Arc::new(table));
        Ok(())
    }

    /// Validates `payload` against `schema_id`, consulting and populating
    /// the validation cache. `mode` governs enforcement strictness for JSON
    /// Schema; it has no effect on protobuf validation, which is always a
    /// strict parse.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownSchemaId`] if no schema is loaded under
    /// `schema_id`, or [`SchemaError::PayloadNotJson`] if the schema is a
    /// JSON Schema and `payload` is not valid JSON.
    pub fn validate(
        &self,
        schema_id: &SchemaId,
        payload: &[u8],
        mode: ValidationMode,
    ) -> Result<Result<(), ValidationError>, SchemaError> {
        let table = self.schemas.load();
        let schema = table
            .get(schema_id)
            .ok_or_else(|| SchemaError::UnknownSchemaId(schema_id.clone()))?;

        let hash = ValidationCache::hash_payload(payload);
        if let Some(cached) = self.cache.get(schema_id, hash) {
            return Ok(cached);
        }

        let outcome = match &schema.compiled {
            CompiledForm::JsonSchema(compiled) => {
                let value: Value = serde_json::from_slice(payload)
                    .map_err(|_| SchemaError::PayloadNotJson(schema_id.clone()))?;
                compiled.validate(&value, mode)
            }
            CompiledForm::Protobuf(compiled) => compiled.validate(payload),
        };

        self.cache.put(schema_id.clone(), hash, outcome.clone());
        Ok(outcome)
    }

    /// Reports the kind of schema loaded under `schema_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownSchemaId`] if no schema is loaded under
    /// `schema_id`.
    pub fn get_kind(&self, schema_id: &SchemaId) -> Result<SchemaKind, SchemaError> {
        let table = self.schemas.load();
        table
            .get(schema_id)
            .map(|schema| schema.kind)
            .ok_or_else(|| SchemaError::UnknownSchemaId(schema_id.clone()))
    }

    /// The source path and load timestamp of a loaded schema, for
    /// diagnostics (e.g. the `/health/detailed` endpoint).
    #[must_use]
    pub fn describe(&self, schema_id: &SchemaId) -> Option<(PathBuf, DateTime<Utc>)> {
        let table = self.schemas.load();
        table
            .get(schema_id)
            .map(|schema| (schema.source_path.clone(), schema.loaded_at))
    }
}

fn compile_source(source: &SchemaSource, now: DateTime<Utc>) -> Result<Schema, SchemaError> {
    match source {
        SchemaSource::JsonSchema { id, path, draft } => {
            let bytes = std::fs::read(path).map_err(|source| SchemaError::Io {
                path: path.clone(),
                source,
            })?;
            let document: Value =
                serde_json::from_slice(&bytes).map_err(|source| SchemaError::InvalidJson {
                    schema_id: id.clone(),
                    source,
                })?;
            let compiled = CompiledJsonSchema::compile(&document, *draft).map_err(|e| {
                SchemaError::JsonSchemaCompile {
                    schema_id: id.clone(),
                    message: e.to_string(),
                }
            })?;
            Ok(Schema {
                kind: SchemaKind::JsonSchema,
                source_path: path.clone(),
                compiled: CompiledForm::JsonSchema(compiled),
                loaded_at: now,
            })
        }
        SchemaSource::Protobuf {
            id,
            descriptor_set_path,
            message_type,
        } => {
            let bytes =
                std::fs::read(descriptor_set_path).map_err(|source| SchemaError::Io {
                    path: descriptor_set_path.clone(),
                    source,
                })?;
            let compiled = CompiledProtobufSchema::compile(&bytes, message_type).map_err(
                |source| SchemaError::ProtobufCompile {
                    schema_id: id.clone(),
                    source,
                },
            )?;
            Ok(Schema {
                kind: SchemaKind::Protobuf,
                source_path: descriptor_set_path.clone(),
                compiled: CompiledForm::Protobuf(compiled),
                loaded_at: now,
            })
        }
    }
}
