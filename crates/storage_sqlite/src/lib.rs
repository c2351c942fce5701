use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Note, NoteDraft, NoteId, NotePatch, NoteQuery, NoteSnapshotStream, NoteStore, QueryOrder,
    StoreError, UserId,
};
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;

const CHANGE_CAPACITY: usize = 256;
const MISSING_INDEX: &str = "The query requires an index on notes(owner_id, pinned DESC, updated_at DESC). \
     Open the store with `composite_index` enabled to create it.";

const NOTE_COLUMNS: &str =
    "id, owner_id, title, content, category, tags, pinned, created_at, updated_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Whether the index backing pinned-then-recent queries exists.
    pub composite_index: bool,
}

/// `NoteStore` on a local SQLite file with in-process change fan-out.
#[derive(Debug, Clone)]
pub struct SqliteNoteStore {
    pool: SqlitePool,
    options: StoreOptions,
    changes: broadcast::Sender<UserId>,
}

impl SqliteNoteStore {
    pub async fn connect(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        Self::with_pool(pool, options).await
    }

    pub async fn in_memory(options: StoreOptions) -> Result<Self> {
        // A single connection that never expires; closing it drops the database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, options).await
    }

    async fn with_pool(pool: SqlitePool, options: StoreOptions) -> Result<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let store = Self {
            pool,
            options,
            changes,
        };
        store.migrate().await?;
        info!(
            composite_index = options.composite_index,
            "note store ready"
        );
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                category TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                pinned INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        if self.options.composite_index {
            sqlx::query(
                r#"
                CREATE INDEX IF NOT EXISTS notes_owner_pinned_updated
                ON notes(owner_id, pinned DESC, updated_at DESC)
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let version = row.get::<String, _>("value").parse::<u32>()?;
        Ok(version)
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    fn check_order(&self, order: QueryOrder) -> Result<(), StoreError> {
        if order == QueryOrder::PinnedThenRecent && !self.options.composite_index {
            return Err(StoreError::FailedPrecondition(MISSING_INDEX.to_string()));
        }
        Ok(())
    }

    fn publish(&self, owner_id: UserId) {
        // No receivers just means nobody is subscribed.
        let _ = self.changes.send(owner_id);
    }
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn subscribe(&self, query: NoteQuery) -> Result<NoteSnapshotStream, StoreError> {
        if let Err(err) = self.check_order(query.order) {
            return Ok(futures::stream::iter([Err::<Vec<Note>, StoreError>(err)]).boxed());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();
        let mut changes = self.changes.subscribe();
        tokio::spawn(async move {
            debug!(owner = %query.owner_id, "note subscription task started");
            'fetch: loop {
                let snapshot = fetch_notes(&pool, &query).await;
                if tx.send(snapshot).is_err() {
                    break;
                }
                loop {
                    let change = tokio::select! {
                        _ = tx.closed() => break 'fetch,
                        change = changes.recv() => change,
                    };
                    match change {
                        Ok(owner) if owner == query.owner_id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "note subscription lagged, re-querying");
                            break;
                        }
                        Err(RecvError::Closed) => break 'fetch,
                    }
                }
            }
            debug!(owner = %query.owner_id, "note subscription task finished");
        });
        let snapshots = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|snapshot| (snapshot, rx))
        });
        Ok(snapshots.boxed())
    }

    async fn query(&self, query: NoteQuery) -> Result<Vec<Note>, StoreError> {
        self.check_order(query.order)?;
        fetch_notes(&self.pool, &query).await
    }

    async fn create(&self, draft: NoteDraft) -> Result<NoteId, StoreError> {
        let id = NoteId::new(Uuid::new_v4().to_string());
        sqlx::query(
            r#"
            INSERT INTO notes(id, owner_id, title, content, category, tags, pinned, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(id.as_str())
        .bind(&draft.owner_id)
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(&draft.category)
        .bind(encode_tags(&draft.tags)?)
        .bind(draft.pinned)
        .bind(draft.created_at.timestamp_micros())
        .bind(draft.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        debug!(note_id = %id, owner = %draft.owner_id, "note inserted");
        self.publish(draft.owner_id);
        Ok(id)
    }

    async fn update(
        &self,
        id: &NoteId,
        patch: NotePatch,
        stamped_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // One statement, so concurrent writers never upgrade a read lock.
        let row = sqlx::query(
            r#"
            UPDATE notes
            SET title = COALESCE(?2, title),
                content = COALESCE(?3, content),
                pinned = COALESCE(?4, pinned),
                category = COALESCE(?5, category),
                tags = COALESCE(?6, tags),
                updated_at = MAX(updated_at, ?7)
            WHERE id = ?1
            RETURNING owner_id
            "#,
        )
        .bind(id.as_str())
        .bind(patch.title.as_deref())
        .bind(patch.content.as_deref())
        .bind(patch.pinned)
        .bind(patch.category.as_deref())
        .bind(patch.tags.as_ref().map(encode_tags).transpose()?)
        .bind(stamped_at.timestamp_micros())
        .fetch_optional(&self.pool)
        .await
        .map_err(transport)?
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        debug!(note_id = %id, "note updated");
        self.publish(row.get("owner_id"));
        Ok(())
    }

    async fn delete(&self, id: &NoteId) -> Result<(), StoreError> {
        let row = sqlx::query("DELETE FROM notes WHERE id = ?1 RETURNING owner_id")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(transport)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        debug!(note_id = %id, "note deleted");
        self.publish(row.get("owner_id"));
        Ok(())
    }
}

async fn fetch_notes(pool: &SqlitePool, query: &NoteQuery) -> Result<Vec<Note>, StoreError> {
    let order = match query.order {
        QueryOrder::PinnedThenRecent => " ORDER BY pinned DESC, updated_at DESC",
        QueryOrder::Unordered => "",
    };
    let rows = sqlx::query(&format!(
        "SELECT {NOTE_COLUMNS} FROM notes WHERE owner_id = ?1{order}"
    ))
    .bind(&query.owner_id)
    .fetch_all(pool)
    .await
    .map_err(transport)?;

    rows.into_iter().map(map_note_row).collect()
}

fn map_note_row(row: SqliteRow) -> Result<Note, StoreError> {
    let tags: BTreeSet<String> = serde_json::from_str(row.get::<&str, _>("tags"))
        .map_err(|err| StoreError::Serialization(format!("invalid tags column: {err}")))?;
    Ok(Note {
        id: NoteId::new(row.get::<String, _>("id")),
        title: row.get("title"),
        content: row.get("content"),
        created_at: from_micros(row.get("created_at"))?,
        updated_at: from_micros(row.get("updated_at"))?,
        pinned: row.get("pinned"),
        owner_id: row.get("owner_id"),
        category: row.get("category"),
        tags,
    })
}

fn encode_tags(tags: &BTreeSet<String>) -> Result<String, StoreError> {
    serde_json::to_string(tags).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {value}")))
}

fn transport(err: sqlx::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}
