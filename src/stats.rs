//! Index and conversation-store overview, printed by `massist stats`.

use sqlx::{Row, SqlitePool};

use manual_assist_core::error::IndexError;
use manual_assist_core::models::{ModelIdentity, OwnerKind};

use crate::config::Config;
use crate::sqlite_store::{load_generations, source_counts, GENERATION_ACTIVE};

/// Chunk count for one source in the active document generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStats {
    pub source_id: String,
    pub chunks: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub active_generation: Option<u64>,
    /// Model the active document generation was built with.
    pub document_model: Option<ModelIdentity>,
    pub document_vectors: i64,
    pub message_vectors: i64,
    pub sessions: i64,
    pub archived_sessions: i64,
    pub messages: i64,
    pub summaries: i64,
    /// Most recent session activity, epoch millis.
    pub last_activity_ms: Option<i64>,
    pub sources: Vec<SourceStats>,
}

fn index_err(e: sqlx::Error) -> IndexError {
    IndexError::storage(e.to_string())
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64, IndexError> {
    sqlx::query_scalar(sql)
        .fetch_one(pool)
        .await
        .map_err(index_err)
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<IndexStats, IndexError> {
    let active = load_generations(pool, OwnerKind::DocumentChunk)
        .await?
        .into_iter()
        .rev()
        .find(|g| g.state == GENERATION_ACTIVE);

    let (document_vectors, sources) = match &active {
        Some(g) => {
            let sources: Vec<SourceStats> = source_counts(pool, g.generation)
                .await?
                .into_iter()
                .map(|(source_id, chunks)| SourceStats { source_id, chunks })
                .collect();
            (sources.iter().map(|s| s.chunks).sum(), sources)
        }
        None => (0, Vec::new()),
    };

    let message_vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE kind = ?")
        .bind(OwnerKind::ConversationMessage.as_str())
        .fetch_one(pool)
        .await
        .map_err(index_err)?;

    let session_row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN state = 'archived' THEN 1 ELSE 0 END), 0) AS archived,
            MAX(last_active_at) AS last_active
        FROM sessions
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(index_err)?;

    Ok(IndexStats {
        active_generation: active.as_ref().map(|g| g.generation),
        document_model: active.map(|g| g.identity),
        document_vectors,
        message_vectors,
        sessions: session_row.get("total"),
        archived_sessions: session_row.get("archived"),
        messages: count(pool, "SELECT COUNT(*) FROM messages").await?,
        summaries: count(pool, "SELECT COUNT(*) FROM summaries").await?,
        last_activity_ms: session_row.get("last_active"),
        sources,
    })
}

pub fn print_stats(config: &Config, stats: &IndexStats) {
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Manual Assist — Index Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    match (&stats.active_generation, &stats.document_model) {
        (Some(generation), Some(model)) => {
            println!("  Generation:  {}", generation);
            println!("  Model:       {}", model);
        }
        _ => println!("  Generation:  none"),
    }
    println!("  Configured:  {}", config.embedding.identity());
    println!("  Chunks:      {}", stats.document_vectors);
    println!();
    println!(
        "  Sessions:    {} ({} archived)",
        stats.sessions, stats.archived_sessions
    );
    println!("  Messages:    {}", stats.messages);
    println!("  Summaries:   {}", stats.summaries);
    println!("  Msg vectors: {}", stats.message_vectors);
    println!(
        "  Last turn:   {}",
        stats
            .last_activity_ms
            .map(|ms| format_ts_relative(ms / 1000))
            .unwrap_or_else(|| "never".to_string())
    );

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(49));
        for s in &stats.sources {
            println!("  {:<40} {:>8}", s.source_id, s.chunks);
        }
    }
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Unix timestamp as a relative time ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
