//! SQLite-backed [`VectorIndex`] and [`ConversationStore`] implementations,
//! plus the bookkeeping table for document index generations.
//!
//! All vectors share the `vectors` table, partitioned by `(kind, generation)`.
//! Conversation-message vectors always live in generation 0; document
//! vectors move to a fresh generation on every full reindex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use manual_assist_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use manual_assist_core::error::{IndexError, MemoryError};
use manual_assist_core::models::{
    ConversationSession, Message, ModelIdentity, OwnerKind, Summary,
};
use manual_assist_core::store::{
    check_dims, rank_hits, ConversationStore, IndexEntry, IndexFilter, IndexHit, VectorIndex,
};

pub const GENERATION_BUILDING: &str = "building";
pub const GENERATION_ACTIVE: &str = "active";
pub const GENERATION_RETIRED: &str = "retired";

/// Generation used for conversation-message vectors.
pub const MESSAGE_GENERATION: u64 = 0;

fn index_err(e: sqlx::Error) -> IndexError {
    IndexError::storage(e.to_string())
}

fn memory_err(e: sqlx::Error) -> MemoryError {
    MemoryError::storage(e.to_string())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// One `(kind, generation)` partition of the `vectors` table.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    kind: OwnerKind,
    generation: u64,
    identity: ModelIdentity,
}

impl SqliteVectorIndex {
    pub fn new(
        pool: SqlitePool,
        kind: OwnerKind,
        generation: u64,
        identity: ModelIdentity,
    ) -> Self {
        Self {
            pool,
            kind,
            generation,
            identity,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn write_entry(
        &self,
        conn: &mut SqliteConnection,
        entry: &IndexEntry,
    ) -> Result<(), IndexError> {
        check_dims(&self.identity, &entry.vector)?;
        let payload = serde_json::to_string(&entry.payload).map_err(|e| IndexError::CorruptEntry {
            owner_id: entry.owner_id.clone(),
            detail: e.to_string(),
        })?;
        sqlx::query(
            r#"
            INSERT INTO vectors (kind, generation, owner_id, model, dims, embedding, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, generation, owner_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding,
                payload_json = excluded.payload_json
            "#,
        )
        .bind(self.kind.as_str())
        .bind(self.generation as i64)
        .bind(&entry.owner_id)
        .bind(&self.identity.name)
        .bind(self.identity.dims as i64)
        .bind(vec_to_blob(&entry.vector))
        .bind(payload)
        .bind(to_millis(Utc::now()))
        .execute(&mut *conn)
        .await
        .map_err(index_err)?;
        Ok(())
    }

    async fn delete_filtered(
        &self,
        conn: &mut SqliteConnection,
        filter: &IndexFilter,
    ) -> Result<usize, IndexError> {
        let result = sqlx::query(
            "DELETE FROM vectors WHERE kind = ? AND generation = ? AND json_extract(payload_json, ?) = ?",
        )
        .bind(self.kind.as_str())
        .bind(self.generation as i64)
        .bind(json_path(&filter.key))
        .bind(&filter.value)
        .execute(&mut *conn)
        .await
        .map_err(index_err)?;
        Ok(result.rows_affected() as usize)
    }
}

fn json_path(key: &str) -> String {
    format!("$.{}", key)
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(index_err)?;
        for entry in &entries {
            self.write_entry(&mut tx, entry).await?;
        }
        tx.commit().await.map_err(index_err)?;
        Ok(())
    }

    async fn replace_matching(
        &self,
        filter: &IndexFilter,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(index_err)?;
        self.delete_filtered(&mut tx, filter).await?;
        for entry in &entries {
            self.write_entry(&mut tx, entry).await?;
        }
        tx.commit().await.map_err(index_err)?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        check_dims(&self.identity, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = match filter {
            Some(f) => {
                sqlx::query(
                    r#"
                    SELECT owner_id, model, embedding, payload_json
                    FROM vectors
                    WHERE kind = ? AND generation = ? AND json_extract(payload_json, ?) = ?
                    ORDER BY seq
                    "#,
                )
                .bind(self.kind.as_str())
                .bind(self.generation as i64)
                .bind(json_path(&f.key))
                .bind(&f.value)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT owner_id, model, embedding, payload_json
                    FROM vectors
                    WHERE kind = ? AND generation = ?
                    ORDER BY seq
                    "#,
                )
                .bind(self.kind.as_str())
                .bind(self.generation as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(index_err)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let owner_id: String = row.get("owner_id");
            let model: String = row.get("model");
            if model != self.identity.name {
                return Err(IndexError::ModelMismatch {
                    indexed: model,
                    query: self.identity.name.clone(),
                });
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            if vector.len() != self.identity.dims {
                return Err(IndexError::CorruptEntry {
                    owner_id,
                    detail: format!("stored vector has {} dims", vector.len()),
                });
            }
            let payload_json: String = row.get("payload_json");
            let payload = serde_json::from_str(&payload_json).map_err(|e| {
                IndexError::CorruptEntry {
                    owner_id: owner_id.clone(),
                    detail: e.to_string(),
                }
            })?;
            hits.push(IndexHit {
                score: cosine_similarity(query, &vector),
                owner_id,
                payload,
            });
        }
        Ok(rank_hits(hits, k))
    }

    async fn delete(&self, owner_id: &str) -> Result<bool, IndexError> {
        let result =
            sqlx::query("DELETE FROM vectors WHERE kind = ? AND generation = ? AND owner_id = ?")
                .bind(self.kind.as_str())
                .bind(self.generation as i64)
                .bind(owner_id)
                .execute(&self.pool)
                .await
                .map_err(index_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_matching(&self, filter: &IndexFilter) -> Result<usize, IndexError> {
        let mut conn = self.pool.acquire().await.map_err(index_err)?;
        self.delete_filtered(&mut conn, filter).await
    }

    async fn len(&self) -> Result<usize, IndexError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE kind = ? AND generation = ?")
                .bind(self.kind.as_str())
                .bind(self.generation as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(index_err)?;
        Ok(count as usize)
    }

    async fn purge(&self) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM vectors WHERE kind = ? AND generation = ?")
            .bind(self.kind.as_str())
            .bind(self.generation as i64)
            .execute(&self.pool)
            .await
            .map_err(index_err)?;
        Ok(())
    }
}

/// A row of the `index_generations` table.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRecord {
    pub generation: u64,
    pub state: String,
    pub identity: ModelIdentity,
    pub created_at: DateTime<Utc>,
}

pub async fn load_generations(
    pool: &SqlitePool,
    kind: OwnerKind,
) -> Result<Vec<GenerationRecord>, IndexError> {
    let rows = sqlx::query(
        "SELECT generation, state, model, dims, created_at FROM index_generations WHERE kind = ? ORDER BY generation",
    )
    .bind(kind.as_str())
    .fetch_all(pool)
    .await
    .map_err(index_err)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let generation: i64 = row.get("generation");
            let dims: i64 = row.get("dims");
            GenerationRecord {
                generation: generation as u64,
                state: row.get("state"),
                identity: ModelIdentity::new(row.get::<String, _>("model"), dims as usize),
                created_at: from_millis(row.get("created_at")),
            }
        })
        .collect())
}

pub async fn record_generation(
    pool: &SqlitePool,
    kind: OwnerKind,
    generation: u64,
    state: &str,
    identity: &ModelIdentity,
) -> Result<(), IndexError> {
    sqlx::query(
        r#"
        INSERT INTO index_generations (kind, generation, state, model, dims, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(kind, generation) DO UPDATE SET state = excluded.state
        "#,
    )
    .bind(kind.as_str())
    .bind(generation as i64)
    .bind(state)
    .bind(&identity.name)
    .bind(identity.dims as i64)
    .bind(to_millis(Utc::now()))
    .execute(pool)
    .await
    .map_err(index_err)?;
    Ok(())
}

/// Mark `generation` active and every previously active one retired.
pub async fn activate_generation(
    pool: &SqlitePool,
    kind: OwnerKind,
    generation: u64,
) -> Result<(), IndexError> {
    let mut tx = pool.begin().await.map_err(index_err)?;
    sqlx::query("UPDATE index_generations SET state = ? WHERE kind = ? AND state = ? AND generation != ?")
        .bind(GENERATION_RETIRED)
        .bind(kind.as_str())
        .bind(GENERATION_ACTIVE)
        .bind(generation as i64)
        .execute(&mut *tx)
        .await
        .map_err(index_err)?;
    sqlx::query("UPDATE index_generations SET state = ? WHERE kind = ? AND generation = ?")
        .bind(GENERATION_ACTIVE)
        .bind(kind.as_str())
        .bind(generation as i64)
        .execute(&mut *tx)
        .await
        .map_err(index_err)?;
    tx.commit().await.map_err(index_err)?;
    Ok(())
}

/// Drop a generation's vectors and its bookkeeping row.
pub async fn drop_generation(
    pool: &SqlitePool,
    kind: OwnerKind,
    generation: u64,
) -> Result<(), IndexError> {
    let mut tx = pool.begin().await.map_err(index_err)?;
    sqlx::query("DELETE FROM vectors WHERE kind = ? AND generation = ?")
        .bind(kind.as_str())
        .bind(generation as i64)
        .execute(&mut *tx)
        .await
        .map_err(index_err)?;
    sqlx::query("DELETE FROM index_generations WHERE kind = ? AND generation = ?")
        .bind(kind.as_str())
        .bind(generation as i64)
        .execute(&mut *tx)
        .await
        .map_err(index_err)?;
    tx.commit().await.map_err(index_err)?;
    Ok(())
}

/// Sessions with message vectors not produced by `identity`, whether the
/// model name or the dimension count differs.
pub async fn stale_message_sessions(
    pool: &SqlitePool,
    identity: &ModelIdentity,
) -> Result<Vec<String>, IndexError> {
    let sessions: Vec<Option<String>> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT json_extract(payload_json, '$.session_id') AS session_id
        FROM vectors
        WHERE kind = ? AND generation = ? AND (model != ? OR dims != ?)
        ORDER BY session_id
        "#,
    )
    .bind(OwnerKind::ConversationMessage.as_str())
    .bind(MESSAGE_GENERATION as i64)
    .bind(&identity.name)
    .bind(identity.dims as i64)
    .fetch_all(pool)
    .await
    .map_err(index_err)?;
    Ok(sessions.into_iter().flatten().collect())
}

/// Chunk counts per source in one document generation.
pub async fn source_counts(
    pool: &SqlitePool,
    generation: u64,
) -> Result<Vec<(String, i64)>, IndexError> {
    let rows = sqlx::query(
        r#"
        SELECT json_extract(payload_json, '$.source_id') AS source_id, COUNT(*) AS chunks
        FROM vectors
        WHERE kind = ? AND generation = ?
        GROUP BY source_id
        ORDER BY source_id
        "#,
    )
    .bind(OwnerKind::DocumentChunk.as_str())
    .bind(generation as i64)
    .fetch_all(pool)
    .await
    .map_err(index_err)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let source: Option<String> = row.get("source_id");
            (source.unwrap_or_default(), row.get("chunks"))
        })
        .collect())
}

/// SQLite implementation of [`ConversationStore`].
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &SqliteRow) -> Result<ConversationSession, MemoryError> {
    let state: String = row.get("state");
    let archived_at: Option<i64> = row.get("archived_at");
    Ok(ConversationSession {
        session_id: row.get("id"),
        owner_id: row.get("owner_id"),
        state: state.parse().map_err(MemoryError::storage)?,
        created_at: from_millis(row.get("created_at")),
        last_active_at: from_millis(row.get("last_active_at")),
        archived_at: archived_at.map(from_millis),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, MemoryError> {
    let role: String = row.get("role");
    let metadata_json: String = row.get("metadata_json");
    Ok(Message {
        message_id: row.get("id"),
        session_id: row.get("session_id"),
        seq: row.get("seq"),
        role: role.parse().map_err(MemoryError::storage)?,
        content: row.get("content"),
        created_at: from_millis(row.get("created_at")),
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|e| MemoryError::storage(format!("message metadata: {}", e)))?,
    })
}

fn summary_from_row(row: &SqliteRow) -> Summary {
    Summary {
        summary_id: row.get("id"),
        session_id: row.get("session_id"),
        first_message_id: row.get("first_message_id"),
        last_message_id: row.get("last_message_id"),
        first_seq: row.get("first_seq"),
        last_seq: row.get("last_seq"),
        summary_text: row.get("summary_text"),
        created_at: from_millis(row.get("created_at")),
    }
}

const SESSION_COLUMNS: &str = "id, owner_id, state, created_at, last_active_at, archived_at";
const MESSAGE_COLUMNS: &str = "id, session_id, seq, role, content, created_at, metadata_json";

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn insert_session(&self, session: &ConversationSession) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO sessions (id, owner_id, state, created_at, last_active_at, archived_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.owner_id)
        .bind(session.state.as_str())
        .bind(to_millis(session.created_at))
        .bind(to_millis(session.last_active_at))
        .bind(session.archived_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(memory_err)?;
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationSession>, MemoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(memory_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, MemoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE owner_id = ? ORDER BY last_active_at DESC, id",
            SESSION_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(memory_err)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn update_session(&self, session: &ConversationSession) -> Result<(), MemoryError> {
        let result = sqlx::query(
            "UPDATE sessions SET state = ?, last_active_at = ?, archived_at = ? WHERE id = ?",
        )
        .bind(session.state.as_str())
        .bind(to_millis(session.last_active_at))
        .bind(session.archived_at.map(to_millis))
        .bind(&session.session_id)
        .execute(&self.pool)
        .await
        .map_err(memory_err)?;
        if result.rows_affected() == 0 {
            return Err(MemoryError::SessionNotFound {
                session_id: session.session_id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(memory_err)?;
        for stmt in [
            "DELETE FROM summaries WHERE session_id = ?",
            "DELETE FROM messages WHERE session_id = ?",
            "DELETE FROM sessions WHERE id = ?",
        ] {
            sqlx::query(stmt)
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(memory_err)?;
        }
        tx.commit().await.map_err(memory_err)?;
        Ok(())
    }

    async fn archived_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, MemoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE state = 'archived' AND archived_at < ? ORDER BY archived_at",
            SESSION_COLUMNS
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(memory_err)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await.map_err(memory_err)?;
        for m in messages {
            let metadata = serde_json::to_string(&m.metadata)
                .map_err(|e| MemoryError::storage(e.to_string()))?;
            sqlx::query(
                "INSERT INTO messages (id, session_id, seq, role, content, created_at, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&m.message_id)
            .bind(&m.session_id)
            .bind(m.seq)
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(to_millis(m.created_at))
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(memory_err)?;
        }
        tx.commit().await.map_err(memory_err)?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(memory_err)?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, MemoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE session_id = ? ORDER BY seq",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(memory_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn get_messages(&self, message_ids: &[String]) -> Result<Vec<Message>, MemoryError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM messages WHERE id IN ({}) ORDER BY session_id, seq",
            MESSAGE_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in message_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(memory_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn last_seq(&self, session_id: &str) -> Result<Option<i64>, MemoryError> {
        sqlx::query_scalar("SELECT MAX(seq) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(memory_err)
    }

    async fn delete_messages(&self, session_id: &str) -> Result<usize, MemoryError> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(memory_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn insert_summary(&self, summary: &Summary) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            INSERT INTO summaries (id, session_id, first_message_id, last_message_id,
                                   first_seq, last_seq, summary_text, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.summary_id)
        .bind(&summary.session_id)
        .bind(&summary.first_message_id)
        .bind(&summary.last_message_id)
        .bind(summary.first_seq)
        .bind(summary.last_seq)
        .bind(&summary.summary_text)
        .bind(to_millis(summary.created_at))
        .execute(&self.pool)
        .await
        .map_err(memory_err)?;
        Ok(())
    }

    async fn list_summaries(&self, session_id: &str) -> Result<Vec<Summary>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, first_message_id, last_message_id,
                   first_seq, last_seq, summary_text, created_at
            FROM summaries WHERE session_id = ? ORDER BY first_seq
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(memory_err)?;
        Ok(rows.iter().map(summary_from_row).collect())
    }

    async fn delete_summaries(&self, session_id: &str) -> Result<usize, MemoryError> {
        let result = sqlx::query("DELETE FROM summaries WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(memory_err)?;
        Ok(result.rows_affected() as usize)
    }
}
