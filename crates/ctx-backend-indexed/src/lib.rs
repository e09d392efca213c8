// SPDX-License-Identifier: MIT OR Apache-2.0
//! The durable, queryable backend (C4): contexts and their relationship
//! edges in SQLite, with secondary indexes, optional full-text search, and
//! bounded-depth relationship-graph traversal (spec §4.5).

use async_trait::async_trait;
use chrono::Utc;
use ctx_backend_core::{
    check_query_capability, Backend, BackendIdentity, PartialUpdate, Query, QueryCapability,
    QueryPredicate,
};
use ctx_core::{ContextRecord, ContextType, RelationshipEdge, Service, StorageLocation};
use ctx_error::{CtxError, ErrorCode};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection as AsyncConnection;

/// `PRAGMA user_version` stamped on a freshly created database. Bumped
/// whenever the schema changes in a way old databases can't transparently
/// absorb; [`IndexedBackend::open`] refuses to start against a mismatched
/// version rather than silently migrating.
const SCHEMA_VERSION: i64 = 1;

/// Durable backend over a SQLite file (or `:memory:` for tests), implementing
/// the full query tier (simple predicates, ranges, full-text, relationship
/// traversal).
pub struct IndexedBackend {
    conn: AsyncConnection,
    fts_enabled: bool,
}

impl IndexedBackend {
    /// Opens (creating if absent) a database at `path` and ensures its
    /// schema. Fails rather than upgrading if an existing database's
    /// `user_version` doesn't match [`SCHEMA_VERSION`].
    pub async fn open(path: &str, fts_enabled: bool) -> Result<Self, CtxError> {
        let conn = AsyncConnection::open(path)
            .await
            .map_err(|e| transport_error("open indexed backend database", e))?;
        let backend = IndexedBackend { conn, fts_enabled };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    /// Opens an in-memory database, for tests and ephemeral use.
    pub async fn open_in_memory(fts_enabled: bool) -> Result<Self, CtxError> {
        let conn = AsyncConnection::open_in_memory()
            .await
            .map_err(|e| transport_error("open in-memory indexed backend", e))?;
        let backend = IndexedBackend { conn, fts_enabled };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn ensure_schema(&self) -> Result<(), CtxError> {
        let fts_enabled = self.fts_enabled;
        self.conn
            .call(move |conn| {
                let existing: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
                if existing != 0 && existing != SCHEMA_VERSION {
                    return Err(tokio_rusqlite::Error::Other(Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "database schema version {existing} does not match required {SCHEMA_VERSION}"
                        ),
                    ))));
                }

                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS contexts (
                        id TEXT PRIMARY KEY,
                        type TEXT NOT NULL,
                        owner TEXT,
                        priority INTEGER NOT NULL,
                        relevance_score REAL NOT NULL,
                        archived INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL,
                        last_accessed TEXT,
                        expires_at TEXT,
                        version INTEGER NOT NULL,
                        searchable_content TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_contexts_type ON contexts(type);
                    CREATE INDEX IF NOT EXISTS idx_contexts_created_at ON contexts(created_at);
                    CREATE INDEX IF NOT EXISTS idx_contexts_last_accessed ON contexts(last_accessed);
                    CREATE INDEX IF NOT EXISTS idx_contexts_priority ON contexts(priority);
                    CREATE INDEX IF NOT EXISTS idx_contexts_relevance ON contexts(relevance_score);
                    CREATE INDEX IF NOT EXISTS idx_contexts_owner ON contexts(owner);
                    CREATE INDEX IF NOT EXISTS idx_contexts_archived ON contexts(archived);
                    CREATE INDEX IF NOT EXISTS idx_contexts_expires_at ON contexts(expires_at);

                    CREATE TABLE IF NOT EXISTS context_relationships (
                        source_id TEXT NOT NULL,
                        target_id TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        weight REAL NOT NULL,
                        bidirectional INTEGER NOT NULL,
                        created_at TEXT NOT NULL,
                        created_by TEXT,
                        description TEXT,
                        properties_json TEXT,
                        PRIMARY KEY (source_id, target_id, kind),
                        FOREIGN KEY (source_id) REFERENCES contexts(id) ON DELETE CASCADE
                    );
                    CREATE INDEX IF NOT EXISTS idx_rel_source ON context_relationships(source_id);
                    CREATE INDEX IF NOT EXISTS idx_rel_target ON context_relationships(target_id);
                    "#,
                )?;

                if fts_enabled {
                    conn.execute_batch(
                        "CREATE VIRTUAL TABLE IF NOT EXISTS contexts_fts USING fts5(id UNINDEXED, searchable_content);",
                    )?;
                }

                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                conn.pragma_update(None, "foreign_keys", true)?;
                Ok(())
            })
            .await
            .map_err(|e| transport_error("create indexed backend schema", e))
    }
}

fn transport_error(what: &str, err: tokio_rusqlite::Error) -> CtxError {
    CtxError::new(
        ErrorCode::BackendUnavailableTransport,
        format!("{what}: {err}"),
    )
    .with_source(err)
}

fn searchable_content(record: &ContextRecord) -> String {
    serde_json::to_value(&record.content)
        .map(|value| flatten_strings(&value))
        .unwrap_or_default()
}

fn flatten_strings(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_strings)
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Object(map) => map
            .values()
            .map(flatten_strings)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn context_type_str(kind: ContextType) -> &'static str {
    match kind {
        ContextType::Conversation => "conversation",
        ContextType::Task => "task",
        ContextType::Knowledge => "knowledge",
        ContextType::Session => "session",
    }
}

fn row_to_record(record_json: String) -> Result<ContextRecord, rusqlite::Error> {
    serde_json::from_str(&record_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Upserts `record` plus its relationship edges inside one transaction.
fn upsert_record(
    conn: &rusqlite::Connection,
    record: &ContextRecord,
    fts_enabled: bool,
) -> rusqlite::Result<()> {
    let record_json = serde_json::to_string(record)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let searchable = searchable_content(record);

    conn.execute(
        r#"
        INSERT INTO contexts
            (id, type, owner, priority, relevance_score, archived, created_at,
             last_accessed, expires_at, version, searchable_content, record_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            owner = excluded.owner,
            priority = excluded.priority,
            relevance_score = excluded.relevance_score,
            archived = excluded.archived,
            created_at = excluded.created_at,
            last_accessed = excluded.last_accessed,
            expires_at = excluded.expires_at,
            version = excluded.version,
            searchable_content = excluded.searchable_content,
            record_json = excluded.record_json
        "#,
        params![
            record.id,
            context_type_str(record.kind),
            record.metadata.owner,
            record.metadata.priority,
            record.metadata.relevance_score,
            record.metadata.archived,
            record.metadata.created_at.to_rfc3339(),
            Some(record.metadata.last_accessed.to_rfc3339()),
            record.metadata.expires_at.map(|t| t.to_rfc3339()),
            record.version as i64,
            searchable,
            record_json,
        ],
    )?;

    conn.execute(
        "DELETE FROM context_relationships WHERE source_id = ?1",
        params![record.id],
    )?;
    for edge in &record.relationships {
        let properties_json = edge
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO context_relationships
                (source_id, target_id, kind, weight, bidirectional, created_at, created_by, description, properties_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                edge.target_id,
                edge.kind,
                edge.weight,
                edge.bidirectional,
                edge.created_at.to_rfc3339(),
                edge.created_by,
                edge.description,
                properties_json,
            ],
        )?;
    }

    if fts_enabled {
        conn.execute(
            "DELETE FROM contexts_fts WHERE id = ?1",
            params![record.id],
        )?;
        conn.execute(
            "INSERT INTO contexts_fts (id, searchable_content) VALUES (?1, ?2)",
            params![record.id, searchable],
        )?;
    }

    Ok(())
}

/// Fields a predicate may filter on, mapped to their fixed JSON pointer into
/// `record_json`. `predicate_sql` only ever emits paths drawn from this list,
/// so a caller-supplied `field` can select a path but never author SQL or an
/// arbitrary JSON path of its own (spec §9: predicates over indexed columns
/// must use exact/prefix matching, never free-form SQL).
const QUERYABLE_FIELDS: &[(&str, &str)] = &[
    ("id", "$.id"),
    ("type", "$.type"),
    ("version", "$.version"),
    ("metadata.owner", "$.metadata.owner"),
    ("metadata.priority", "$.metadata.priority"),
    ("metadata.relevance_score", "$.metadata.relevance_score"),
    ("metadata.quality_score", "$.metadata.quality_score"),
    ("metadata.completeness_score", "$.metadata.completeness_score"),
    ("metadata.accuracy_score", "$.metadata.accuracy_score"),
    ("metadata.archived", "$.metadata.archived"),
    ("metadata.created_at", "$.metadata.created_at"),
    ("metadata.last_accessed", "$.metadata.last_accessed"),
    ("metadata.expires_at", "$.metadata.expires_at"),
    ("metadata.access_count", "$.metadata.access_count"),
];

fn json_path_for_field(field: &str) -> Option<&'static str> {
    QUERYABLE_FIELDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, path)| *path)
}

fn unsupported_field(field: &str) -> CtxError {
    CtxError::new(
        ErrorCode::ValidationQueryUnsupported,
        format!("field '{field}' is not queryable"),
    )
}

fn predicate_sql(
    predicate: &QueryPredicate,
    index: usize,
) -> Result<(String, Vec<serde_json::Value>), CtxError> {
    match predicate {
        QueryPredicate::Equals { field, value } => {
            let path = json_path_for_field(field).ok_or_else(|| unsupported_field(field))?;
            Ok((
                format!("json_extract(record_json, ?{index}) = ?{}", index + 1),
                vec![serde_json::Value::String(path.to_string()), value.clone()],
            ))
        }
        QueryPredicate::Range { field, min, max } => {
            let path = json_path_for_field(field).ok_or_else(|| unsupported_field(field))?;
            let mut clauses = Vec::new();
            let mut values = Vec::new();
            let mut next = index;
            if let Some(min) = min {
                clauses.push(format!("json_extract(record_json, ?{next}) >= ?{}", next + 1));
                values.push(serde_json::Value::String(path.to_string()));
                values.push(min.clone());
                next += 2;
            }
            if let Some(max) = max {
                clauses.push(format!("json_extract(record_json, ?{next}) <= ?{}", next + 1));
                values.push(serde_json::Value::String(path.to_string()));
                values.push(max.clone());
            }
            Ok((clauses.join(" AND "), values))
        }
    }
}

fn json_value_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    match value {
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        serde_json::Value::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

#[async_trait]
impl Backend for IndexedBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            service: Service::Indexed,
        }
    }

    fn query_capability(&self) -> QueryCapability {
        QueryCapability::Full
    }

    async fn store(&self, record: &ContextRecord) -> Result<StorageLocation, CtxError> {
        let record = record.clone();
        let fts_enabled = self.fts_enabled;
        let now = Utc::now();
        let id = record.id.clone();
        self.conn
            .call(move |conn| {
                upsert_record(conn, &record, fts_enabled)?;
                Ok(())
            })
            .await
            .map_err(|e| transport_error("store context", e))?;

        Ok(StorageLocation {
            context_id: id,
            service: Service::Indexed,
            path: "contexts".to_string(),
            stored_at: now,
            storage_size: 0,
            compressed: false,
            encrypted: false,
            access_count: 0,
        })
    }

    async fn retrieve(&self, id: &str) -> Result<Option<ContextRecord>, CtxError> {
        let id = id.to_string();
        let now = Utc::now();
        let record: Option<ContextRecord> = self
            .conn
            .call(move |conn| {
                let record_json: Option<String> = conn
                    .query_row(
                        "SELECT record_json FROM contexts WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match record_json {
                    Some(json) => Ok(Some(row_to_record(json)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| transport_error("retrieve context", e))?;

        let Some(mut record) = record else {
            return Ok(None);
        };
        if record.metadata.is_expired(now) {
            self.delete(&record.id).await?;
            return Ok(None);
        }
        record.metadata.record_access(now);
        let refreshed = record.clone();
        let fts_enabled = self.fts_enabled;
        self.conn
            .call(move |conn| {
                upsert_record(conn, &refreshed, fts_enabled)?;
                Ok(())
            })
            .await
            .map_err(|e| transport_error("record access on retrieve", e))?;
        Ok(Some(record))
    }

    async fn update(&self, id: &str, partial: &PartialUpdate) -> Result<bool, CtxError> {
        let id_owned = id.to_string();
        let existing = self.retrieve(&id_owned).await?;
        let Some(mut record) = existing else {
            return Ok(false);
        };

        if let Some(content) = partial.content.clone() {
            record.content = content;
        }
        if let Some(priority) = partial.priority {
            record.metadata.priority = priority;
        }
        if let Some(score) = partial.relevance_score {
            record.metadata.relevance_score = score;
        }
        if let Some(archived) = partial.archived {
            record.metadata.archived = archived;
        }
        if let Some(owner) = partial.owner.clone() {
            record.metadata.owner = Some(owner);
        }
        if let Some(tags) = partial.tags.clone() {
            record.metadata.tags = tags;
        }
        if let Some(ttl) = partial.ttl {
            record.metadata.ttl = Some(ttl);
            record.metadata.expires_at = Some(record.metadata.created_at + chrono::Duration::seconds(ttl as i64));
        }

        let now = Utc::now();
        record.bump_version(now);
        record.checksum = ctx_core::content_checksum(&record.content)
            .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;

        if let Err(errors) = ctx_validate::validate(&record) {
            let first = errors.first().map(|e| e.to_string()).unwrap_or_default();
            return Err(CtxError::new(
                ErrorCode::ValidationInvariantViolation,
                "updated record failed validation",
            )
            .with_context("first_issue", serde_json::json!(first)));
        }

        let fts_enabled = self.fts_enabled;
        self.conn
            .call(move |conn| {
                upsert_record(conn, &record, fts_enabled)?;
                Ok(())
            })
            .await
            .map_err(|e| transport_error("update context", e))?;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<(), CtxError> {
        let id = id.to_string();
        let fts_enabled = self.fts_enabled;
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM contexts WHERE id = ?1", params![id])?;
                conn.execute(
                    "DELETE FROM context_relationships WHERE source_id = ?1 OR target_id = ?1",
                    params![id],
                )?;
                if fts_enabled {
                    conn.execute("DELETE FROM contexts_fts WHERE id = ?1", params![id])?;
                }
                Ok(())
            })
            .await
            .map_err(|e| transport_error("delete context", e))
    }

    async fn query(&self, query: &Query) -> Result<Vec<ContextRecord>, CtxError> {
        check_query_capability(self.query_capability(), query)?;

        if let Some(seed) = query.relationship_seed.clone() {
            let depth = query.relationship_depth as i64;
            let records: Vec<ContextRecord> = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(
                        r#"
                        WITH RECURSIVE reachable(id, depth) AS (
                            SELECT ?1, 0
                            UNION
                            SELECT
                                CASE WHEN r.source_id = t.id THEN r.target_id ELSE r.source_id END,
                                t.depth + 1
                            FROM context_relationships r
                            JOIN reachable t
                              ON r.source_id = t.id OR (r.bidirectional = 1 AND r.target_id = t.id)
                            WHERE t.depth < ?2
                        )
                        SELECT DISTINCT c.record_json
                        FROM contexts c
                        JOIN reachable r ON c.id = r.id
                        WHERE r.id != ?1
                        "#,
                    )?;
                    let rows = stmt.query_map(params![seed, depth], |row| {
                        let json: String = row.get(0)?;
                        Ok(json)
                    })?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row_to_record(row?)?);
                    }
                    Ok(out)
                })
                .await
                .map_err(|e| transport_error("relationship traversal query", e))?;
            return Ok(apply_ordering(records, query));
        }

        if let Some(text) = query.full_text.clone() {
            if !self.fts_enabled {
                return Err(CtxError::new(
                    ErrorCode::ValidationQueryUnsupported,
                    "full-text search is disabled on this backend",
                ));
            }
            let records: Vec<ContextRecord> = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(
                        r#"
                        SELECT c.record_json
                        FROM contexts c
                        JOIN contexts_fts f ON f.id = c.id
                        WHERE contexts_fts MATCH ?1
                        ORDER BY bm25(contexts_fts) ASC, c.created_at DESC
                        "#,
                    )?;
                    let rows = stmt.query_map(params![text], |row| {
                        let json: String = row.get(0)?;
                        Ok(json)
                    })?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row_to_record(row?)?);
                    }
                    Ok(out)
                })
                .await
                .map_err(|e| transport_error("full-text query", e))?;
            return Ok(apply_ordering(records, query));
        }

        let mut clauses = Vec::new();
        let mut values: Vec<serde_json::Value> = Vec::new();
        for predicate in &query.predicates {
            let (clause, mut vals) = predicate_sql(predicate, values.len() + 1)?;
            clauses.push(clause);
            values.append(&mut vals);
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT record_json FROM contexts {where_clause}");

        let records: Vec<ContextRecord> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let sql_values: Vec<rusqlite::types::Value> =
                    values.iter().map(json_value_to_sql).collect();
                let rows = stmt.query_map(rusqlite::params_from_iter(sql_values), |row| {
                    let json: String = row.get(0)?;
                    Ok(json)
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row_to_record(row?)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| transport_error("predicate query", e))?;
        Ok(apply_ordering(records, query))
    }

    async fn health_check(&self) -> bool {
        self.conn
            .call(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await
            .is_ok()
    }
}

fn apply_ordering(mut records: Vec<ContextRecord>, query: &Query) -> Vec<ContextRecord> {
    if let Some(field) = &query.sort_by {
        records.sort_by(|a, b| {
            let av = field_as_value(a, field);
            let bv = field_as_value(b, field);
            av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
        });
        if query.sort_descending {
            records.reverse();
        }
    }
    if let Some(offset) = query.offset {
        records = records.into_iter().skip(offset).collect();
    }
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    records
}

fn field_as_value(record: &ContextRecord, field: &str) -> f64 {
    match field {
        "metadata.priority" | "priority" => record.metadata.priority as f64,
        "metadata.relevanceScore" | "relevance_score" => record.metadata.relevance_score,
        "version" => record.version as f64,
        _ => 0.0,
    }
}

/// Stores (or replaces, keyed by `(source, target, kind)`) a relationship
/// edge originating from `source_id`, independent of a full record rewrite.
pub async fn upsert_relationship(
    backend: &IndexedBackend,
    source_id: &str,
    edge: &RelationshipEdge,
) -> Result<(), CtxError> {
    let source_id = source_id.to_string();
    let edge = edge.clone();
    backend
        .conn
        .call(move |conn| {
            let properties_json = edge
                .properties
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO context_relationships
                    (source_id, target_id, kind, weight, bidirectional, created_at, created_by, description, properties_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    source_id,
                    edge.target_id,
                    edge.kind,
                    edge.weight,
                    edge.bidirectional,
                    edge.created_at.to_rfc3339(),
                    edge.created_by,
                    edge.description,
                    properties_json,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| transport_error("upsert relationship", e))
}
