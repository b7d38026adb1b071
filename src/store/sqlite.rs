use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use super::StateStore;
use crate::error::StoreError;
use crate::model::{
    CreateState, MessageSnapshot, MessageType, ReceiptStatus, StateHistoryEntry, TrackedMessage,
    TransportState, UnixTimeMs, UpdateState,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        message_type TEXT NOT NULL,
        external_ref_id TEXT NOT NULL UNIQUE,
        external_message_url TEXT NOT NULL UNIQUE,
        transport_state TEXT,
        receipt_status TEXT,
        last_state_change INTEGER NOT NULL,
        last_polled_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_pollable ON messages(transport_state, last_polled_at);

    CREATE TABLE IF NOT EXISTS message_state_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL REFERENCES messages(id),
        old_transport_state TEXT,
        new_transport_state TEXT,
        old_receipt_status TEXT,
        new_receipt_status TEXT,
        changed_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_history_message ON message_state_history(message_id, changed_at);
"#;

const MESSAGE_COLUMNS: &str = "id, message_type, external_ref_id, external_message_url, \
     transport_state, receipt_status, last_state_change, last_polled_at, created_at, updated_at";

// Keeps bulk updates well under SQLite's bound-parameter limit
const MAX_BULK_PARAMS: usize = 500;

/// SQLite-backed store. Writes run in IMMEDIATE transactions so concurrent
/// writers to the same message are serialized.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Storage("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self, create), fields(external_ref_id = %create.external_ref_id))]
    async fn create_initial_state(
        &self,
        create: CreateState,
    ) -> Result<MessageSnapshot, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            ensure_not_tracked(&tx, &create)?;
            insert_message(&tx, &create)?;
            append_history(&tx, create.id, &SignalChange::baseline(), create.occurred_at)?;

            let snapshot = load_snapshot(&tx, create.external_ref_id)?
                .ok_or(StoreError::MessageNotFound(create.external_ref_id))?;
            tx.commit()?;

            debug!("initial state created");
            Ok(snapshot)
        })
        .await
    }

    #[instrument(skip(self, update), fields(external_ref_id = %update.external_ref_id))]
    async fn record_state_change(
        &self,
        update: UpdateState,
    ) -> Result<MessageSnapshot, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let message_id = find_message_id(&tx, update.external_ref_id)?
                .ok_or(StoreError::MessageNotFound(update.external_ref_id))?;

            // Compare-and-swap on the stored signals
            let changed = tx.execute(
                r#"
                UPDATE messages
                SET transport_state = ?1, receipt_status = ?2, last_state_change = ?3, updated_at = ?3
                WHERE id = ?4 AND transport_state IS ?5 AND receipt_status IS ?6
                "#,
                params![
                    update.new_transport_state.map(|s| s.as_str()),
                    update.new_receipt_status.map(|s| s.as_str()),
                    update.occurred_at.0 as i64,
                    message_id.to_string(),
                    update.old_transport_state.map(|s| s.as_str()),
                    update.old_receipt_status.map(|s| s.as_str()),
                ],
            )?;

            if changed == 0 {
                return Err(StoreError::ConcurrentModification {
                    external_ref_id: update.external_ref_id,
                });
            }

            append_history(
                &tx,
                message_id,
                &SignalChange::from_update(&update),
                update.occurred_at,
            )?;

            let snapshot = load_snapshot(&tx, update.external_ref_id)?
                .ok_or(StoreError::MessageNotFound(update.external_ref_id))?;
            tx.commit()?;

            Ok(snapshot)
        })
        .await
    }

    async fn get_snapshot(
        &self,
        external_ref_id: Uuid,
    ) -> Result<Option<MessageSnapshot>, StoreError> {
        self.with_conn(move |conn| load_snapshot(conn, external_ref_id))
            .await
    }

    async fn find_pollable(
        &self,
        now: UnixTimeMs,
        min_poll_age: Duration,
        limit: usize,
    ) -> Result<Vec<TrackedMessage>, StoreError> {
        let cutoff = now.saturating_sub(min_poll_age);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE transport_state IS NULL
                  AND (last_polled_at IS NULL OR last_polled_at < ?1)
                ORDER BY last_polled_at ASC NULLS FIRST, created_at ASC
                LIMIT ?2
                "#
            ))?;

            let rows = stmt
                .query_map(params![cutoff.0 as i64, limit], MessageRow::read)?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter().map(MessageRow::into_message).collect()
        })
        .await
    }

    async fn mark_polled(
        &self,
        external_ref_ids: &[Uuid],
        now: UnixTimeMs,
    ) -> Result<usize, StoreError> {
        if external_ref_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = external_ref_ids.iter().map(Uuid::to_string).collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut marked = 0;

            for chunk in ids.chunks(MAX_BULK_PARAMS) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "UPDATE messages SET last_polled_at = ?1 WHERE external_ref_id IN ({placeholders})"
                );
                let values = std::iter::once(Value::Integer(now.0 as i64))
                    .chain(chunk.iter().cloned().map(Value::Text));
                marked += tx.execute(&sql, params_from_iter(values))?;
            }

            tx.commit()?;
            Ok(marked)
        })
        .await
    }
}

// ============================================================================
// Message Table
// ============================================================================

fn ensure_not_tracked(tx: &Transaction<'_>, create: &CreateState) -> Result<(), StoreError> {
    if let Some(existing_message_id) = find_message_id(tx, create.external_ref_id)? {
        return Err(StoreError::ConflictingExternalReferenceId {
            external_ref_id: create.external_ref_id,
            existing_message_id,
            new_message_id: create.id,
        });
    }

    let by_url: Option<String> = tx
        .query_row(
            "SELECT id FROM messages WHERE external_message_url = ?1",
            params![create.external_message_url.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(existing) = by_url {
        return Err(StoreError::ConflictingExternalMessageUrl {
            external_message_url: create.external_message_url.clone(),
            existing_message_id: parse_uuid("id", &existing)?,
            new_message_id: create.id,
        });
    }

    Ok(())
}

fn insert_message(tx: &Transaction<'_>, create: &CreateState) -> Result<(), StoreError> {
    let at = create.occurred_at.0 as i64;
    tx.execute(
        r#"
        INSERT INTO messages (id, message_type, external_ref_id, external_message_url,
                              transport_state, receipt_status, last_state_change,
                              last_polled_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, NULL, ?5, ?5)
        "#,
        params![
            create.id.to_string(),
            create.message_type.as_str(),
            create.external_ref_id.to_string(),
            create.external_message_url.as_str(),
            at,
        ],
    )?;
    Ok(())
}

fn find_message_id(conn: &Connection, external_ref_id: Uuid) -> Result<Option<Uuid>, StoreError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM messages WHERE external_ref_id = ?1",
            params![external_ref_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    id.map(|id| parse_uuid("id", &id)).transpose()
}

fn load_snapshot(
    conn: &Connection,
    external_ref_id: Uuid,
) -> Result<Option<MessageSnapshot>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_ref_id = ?1"),
            params![external_ref_id.to_string()],
            MessageRow::read,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };
    let message = row.into_message()?;
    let history = load_history(conn, message.id)?;

    Ok(Some(MessageSnapshot { message, history }))
}

struct MessageRow {
    id: String,
    message_type: String,
    external_ref_id: String,
    external_message_url: String,
    transport_state: Option<String>,
    receipt_status: Option<String>,
    last_state_change: i64,
    last_polled_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_type: row.get(1)?,
            external_ref_id: row.get(2)?,
            external_message_url: row.get(3)?,
            transport_state: row.get(4)?,
            receipt_status: row.get(5)?,
            last_state_change: row.get(6)?,
            last_polled_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<TrackedMessage, StoreError> {
        Ok(TrackedMessage {
            id: parse_uuid("id", &self.id)?,
            message_type: MessageType::parse(&self.message_type).ok_or(StoreError::CorruptedRow {
                column: "message_type",
                value: self.message_type.clone(),
            })?,
            external_ref_id: parse_uuid("external_ref_id", &self.external_ref_id)?,
            external_message_url: Url::parse(&self.external_message_url).map_err(|_| {
                StoreError::CorruptedRow {
                    column: "external_message_url",
                    value: self.external_message_url.clone(),
                }
            })?,
            transport_state: parse_transport("transport_state", self.transport_state)?,
            receipt_status: parse_receipt("receipt_status", self.receipt_status)?,
            last_state_change: parse_time("last_state_change", self.last_state_change)?,
            last_polled_at: self
                .last_polled_at
                .map(|at| parse_time("last_polled_at", at))
                .transpose()?,
            created_at: parse_time("created_at", self.created_at)?,
            updated_at: parse_time("updated_at", self.updated_at)?,
        })
    }
}

// ============================================================================
// History Log
// ============================================================================

struct SignalChange {
    old_transport_state: Option<TransportState>,
    new_transport_state: Option<TransportState>,
    old_receipt_status: Option<ReceiptStatus>,
    new_receipt_status: Option<ReceiptStatus>,
}

impl SignalChange {
    fn baseline() -> Self {
        Self {
            old_transport_state: None,
            new_transport_state: None,
            old_receipt_status: None,
            new_receipt_status: None,
        }
    }

    fn from_update(update: &UpdateState) -> Self {
        Self {
            old_transport_state: update.old_transport_state,
            new_transport_state: update.new_transport_state,
            old_receipt_status: update.old_receipt_status,
            new_receipt_status: update.new_receipt_status,
        }
    }
}

/// Append one history row. Fails with `MessageNotFound` when the message
/// does not exist.
fn append_history(
    conn: &Connection,
    message_id: Uuid,
    change: &SignalChange,
    changed_at: UnixTimeMs,
) -> Result<(), StoreError> {
    let result = conn.execute(
        r#"
        INSERT INTO message_state_history (message_id, old_transport_state, new_transport_state,
                                           old_receipt_status, new_receipt_status, changed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            message_id.to_string(),
            change.old_transport_state.map(|s| s.as_str()),
            change.new_transport_state.map(|s| s.as_str()),
            change.old_receipt_status.map(|s| s.as_str()),
            change.new_receipt_status.map(|s| s.as_str()),
            changed_at.0 as i64,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::MessageNotFound(message_id))
        }
        Err(e) => Err(e.into()),
    }
}

fn load_history(conn: &Connection, message_id: Uuid) -> Result<Vec<StateHistoryEntry>, StoreError> {
    type HistoryRow = (
        i64,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        i64,
    );

    let mut stmt = conn.prepare(
        r#"
        SELECT id, message_id, old_transport_state, new_transport_state,
               old_receipt_status, new_receipt_status, changed_at
        FROM message_state_history
        WHERE message_id = ?1
        ORDER BY changed_at ASC, id ASC
        "#,
    )?;

    let rows: Vec<HistoryRow> = stmt
        .query_map(params![message_id.to_string()], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    rows.into_iter()
        .map(|(id, message_id, old_t, new_t, old_r, new_r, changed_at)| {
            Ok(StateHistoryEntry {
                id,
                message_id: parse_uuid("message_id", &message_id)?,
                old_transport_state: parse_transport("old_transport_state", old_t)?,
                new_transport_state: parse_transport("new_transport_state", new_t)?,
                old_receipt_status: parse_receipt("old_receipt_status", old_r)?,
                new_receipt_status: parse_receipt("new_receipt_status", new_r)?,
                changed_at: parse_time("changed_at", changed_at)?,
            })
        })
        .collect()
}

// ============================================================================
// Column Parsing
// ============================================================================

fn parse_uuid(column: &'static str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::CorruptedRow {
        column,
        value: value.to_string(),
    })
}

fn parse_time(column: &'static str, value: i64) -> Result<UnixTimeMs, StoreError> {
    u64::try_from(value)
        .map(UnixTimeMs)
        .map_err(|_| StoreError::CorruptedRow {
            column,
            value: value.to_string(),
        })
}

fn parse_transport(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<TransportState>, StoreError> {
    value
        .map(|v| TransportState::parse(&v).ok_or(StoreError::CorruptedRow { column, value: v }))
        .transpose()
}

fn parse_receipt(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<ReceiptStatus>, StoreError> {
    value
        .map(|v| ReceiptStatus::parse(&v).ok_or(StoreError::CorruptedRow { column, value: v }))
        .transpose()
}
