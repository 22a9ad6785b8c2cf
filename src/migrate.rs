use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Conversation sessions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_active_at INTEGER NOT NULL,
            archived_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Messages, ordered per session by seq
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(session_id, seq),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Summaries covering a contiguous seq range
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS summaries (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            first_message_id TEXT NOT NULL,
            last_message_id TEXT NOT NULL,
            first_seq INTEGER NOT NULL,
            last_seq INTEGER NOT NULL,
            summary_text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vectors for both document chunks and conversation messages.
    // seq is the insertion order used to break score ties.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            generation INTEGER NOT NULL,
            owner_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            payload_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(kind, generation, owner_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Document index generations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_generations (
            kind TEXT NOT NULL,
            generation INTEGER NOT NULL,
            state TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (kind, generation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id, first_seq)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id, last_active_at)",
        "CREATE INDEX IF NOT EXISTS idx_vectors_partition ON vectors(kind, generation, seq)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
