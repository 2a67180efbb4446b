#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use profile_store_core::{
    argument_text, format_rfc3339, kind_hint, now_utc, parse_rfc3339_utc, pivot_tags,
    sort_case_insensitive, validate_tag, BatchPayload, BatchRecord, BatchReport, CallName,
    CallStackItem, CallStackPayload, CallStackRecord, EventId, EventKind, EventPayload, EventRecord,
    EventRef, EventRejection, FileAccessPayload, FileAccessRecord, InternedId, MetadataFilter,
    MetadataValue, ProfileStore, ScopeKind, SenderId, SenderPayload, SenderRecord, SequenceKind,
    SqlStatementPayload, SqlStatementRecord, StackFrame,
};
use rusqlite::types::ToSql;
use rusqlite::{ffi, params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use ulid::Ulid;

const PROFILE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_PROFILE_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS senders (
  sender_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  address TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_batches (
  batch_id TEXT PRIMARY KEY,
  sender_id INTEGER NOT NULL,
  accepted INTEGER NOT NULL CHECK (accepted >= 0),
  rejected INTEGER NOT NULL CHECK (rejected >= 0),
  received_at TEXT NOT NULL,
  FOREIGN KEY (sender_id) REFERENCES senders(sender_id)
);

CREATE TABLE IF NOT EXISTS interned_strings (
  string_id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope TEXT NOT NULL CHECK (scope IN ('sql_text', 'file_path', 'argument_value')),
  text TEXT NOT NULL,
  UNIQUE(scope, text)
);

CREATE TABLE IF NOT EXISTS stack_frames (
  frame_id INTEGER PRIMARY KEY AUTOINCREMENT,
  module TEXT NOT NULL,
  function TEXT NOT NULL,
  UNIQUE(module, function)
);

-- class_name is '' when absent: NULLs never collide under UNIQUE.
CREATE TABLE IF NOT EXISTS call_names (
  call_name_id INTEGER PRIMARY KEY AUTOINCREMENT,
  module TEXT NOT NULL,
  class_name TEXT NOT NULL DEFAULT '',
  function TEXT NOT NULL,
  UNIQUE(module, class_name, function)
);

CREATE TABLE IF NOT EXISTS metadata_tags (
  tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  UNIQUE(key, value)
);

CREATE TABLE IF NOT EXISTS call_stack_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL,
  sender_id INTEGER NOT NULL,
  call_name_id INTEGER NOT NULL,
  occurred_at REAL NOT NULL,
  duration REAL NOT NULL CHECK (duration >= 0),
  sample_ref TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (batch_id) REFERENCES ingest_batches(batch_id),
  FOREIGN KEY (sender_id) REFERENCES senders(sender_id),
  FOREIGN KEY (call_name_id) REFERENCES call_names(call_name_id)
);

CREATE TABLE IF NOT EXISTS call_stack_items (
  event_id INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  module TEXT NOT NULL,
  function TEXT NOT NULL,
  line_number INTEGER NOT NULL,
  total_calls INTEGER NOT NULL,
  native_calls INTEGER NOT NULL,
  cumulative_time REAL NOT NULL,
  total_time REAL NOT NULL,
  PRIMARY KEY (event_id, position),
  FOREIGN KEY (event_id) REFERENCES call_stack_events(event_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sql_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL,
  sender_id INTEGER NOT NULL,
  sql_text_id INTEGER NOT NULL,
  occurred_at REAL NOT NULL,
  duration REAL NOT NULL CHECK (duration >= 0),
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (batch_id) REFERENCES ingest_batches(batch_id),
  FOREIGN KEY (sender_id) REFERENCES senders(sender_id),
  FOREIGN KEY (sql_text_id) REFERENCES interned_strings(string_id)
);

CREATE TABLE IF NOT EXISTS sql_event_frames (
  event_id INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  frame_id INTEGER NOT NULL,
  PRIMARY KEY (event_id, position),
  FOREIGN KEY (event_id) REFERENCES sql_events(event_id) ON DELETE CASCADE,
  FOREIGN KEY (frame_id) REFERENCES stack_frames(frame_id)
);

CREATE TABLE IF NOT EXISTS sql_event_arguments (
  event_id INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  argument_id INTEGER NOT NULL,
  PRIMARY KEY (event_id, position),
  FOREIGN KEY (event_id) REFERENCES sql_events(event_id) ON DELETE CASCADE,
  FOREIGN KEY (argument_id) REFERENCES interned_strings(string_id)
);

CREATE TABLE IF NOT EXISTS file_access_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL,
  sender_id INTEGER NOT NULL,
  file_path_id INTEGER NOT NULL,
  occurred_at REAL NOT NULL,
  duration REAL NOT NULL CHECK (duration >= 0),
  time_to_open REAL NOT NULL CHECK (time_to_open >= 0),
  bytes_written INTEGER NOT NULL CHECK (bytes_written >= 0),
  mode TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (batch_id) REFERENCES ingest_batches(batch_id),
  FOREIGN KEY (sender_id) REFERENCES senders(sender_id),
  FOREIGN KEY (file_path_id) REFERENCES interned_strings(string_id)
);

CREATE TABLE IF NOT EXISTS event_tags (
  event_kind TEXT NOT NULL CHECK (event_kind IN ('call_stack', 'sql_statement', 'file_access')),
  event_id INTEGER NOT NULL,
  tag_id INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  PRIMARY KEY (event_kind, event_id, tag_id),
  UNIQUE (event_kind, event_id, position),
  FOREIGN KEY (tag_id) REFERENCES metadata_tags(tag_id)
);

CREATE INDEX IF NOT EXISTS idx_event_tags_tag ON event_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_sql_events_text ON sql_events(sql_text_id);
CREATE INDEX IF NOT EXISTS idx_file_access_events_path ON file_access_events(file_path_id);
CREATE INDEX IF NOT EXISTS idx_call_stack_events_call ON call_stack_events(call_name_id);

CREATE TRIGGER IF NOT EXISTS trg_call_stack_events_drop_tags
AFTER DELETE ON call_stack_events
BEGIN
  DELETE FROM event_tags WHERE event_kind = 'call_stack' AND event_id = OLD.event_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_sql_events_drop_tags
AFTER DELETE ON sql_events
BEGIN
  DELETE FROM event_tags WHERE event_kind = 'sql_statement' AND event_id = OLD.event_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_file_access_events_drop_tags
AFTER DELETE ON file_access_events
BEGIN
  DELETE FROM event_tags WHERE event_kind = 'file_access' AND event_id = OLD.event_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_call_stack_events_no_update
BEFORE UPDATE ON call_stack_events
BEGIN
  SELECT RAISE(FAIL, 'call_stack_events is insert-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_sql_events_no_update
BEFORE UPDATE ON sql_events
BEGIN
  SELECT RAISE(FAIL, 'sql_events is insert-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_file_access_events_no_update
BEFORE UPDATE ON file_access_events
BEGIN
  SELECT RAISE(FAIL, 'file_access_events is insert-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_interned_strings_no_update
BEFORE UPDATE ON interned_strings
BEGIN
  SELECT RAISE(FAIL, 'interned_strings is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_stack_frames_no_update
BEFORE UPDATE ON stack_frames
BEGIN
  SELECT RAISE(FAIL, 'stack_frames is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_call_names_no_update
BEFORE UPDATE ON call_names
BEGIN
  SELECT RAISE(FAIL, 'call_names is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_metadata_tags_no_update
BEFORE UPDATE ON metadata_tags
BEGIN
  SELECT RAISE(FAIL, 'metadata_tags is append-only');
END;
";

const SELECT_CALL_STACK: &str = "SELECT
        e.event_id, e.sender_id, e.batch_id, c.module, c.class_name, c.function,
        e.occurred_at, e.duration, e.sample_ref, e.recorded_at
     FROM call_stack_events e
     JOIN call_names c ON c.call_name_id = e.call_name_id";

const SELECT_SQL_STATEMENT: &str = "SELECT
        e.event_id, e.sender_id, e.batch_id, t.text,
        e.occurred_at, e.duration, e.recorded_at
     FROM sql_events e
     JOIN interned_strings t ON t.string_id = e.sql_text_id";

const SELECT_FILE_ACCESS: &str = "SELECT
        e.event_id, e.sender_id, e.batch_id, p.text,
        e.occurred_at, e.duration, e.time_to_open, e.bytes_written, e.mode, e.recorded_at
     FROM file_access_events e
     JOIN interned_strings p ON p.string_id = e.file_path_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Handle over one `SQLite` connection. Concurrent writers each open their own
/// handle against the same database file.
pub struct SqliteProfileStore {
    conn: Connection,
}

struct BatchContext<'a> {
    batch_id: Ulid,
    sender_id: SenderId,
    recorded_at: &'a str,
}

impl SqliteProfileStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(options.busy_timeout)
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_PROFILE_V1)
            .context("failed to apply profile schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROFILE_SCHEMA_VERSION, now],
            )
            .context("failed to register profile schema migration")?;

        Ok(())
    }

    /// Returns the id of the `(scope, text)` row, creating it on first use.
    pub fn intern(&self, scope: ScopeKind, text: &str) -> Result<InternedId> {
        intern_string(&self.conn, scope, text)
    }

    pub fn intern_stack_frame(&self, frame: &StackFrame) -> Result<InternedId> {
        intern_stack_frame(&self.conn, frame)
    }

    pub fn intern_call_name(&self, call: &CallName) -> Result<InternedId> {
        intern_call_name(&self.conn, call)
    }

    /// Links `items` to an existing SQL event, positions `0..items.len()`.
    pub fn attach_sequence(
        &mut self,
        event_id: EventId,
        kind: SequenceKind,
        items: &[InternedId],
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start sequence transaction")?;
        insert_sequence(&tx, event_id, kind, items)?;
        tx.commit().context("failed to commit sequence transaction")
    }

    pub fn read_sequence(&self, event_id: EventId, kind: SequenceKind) -> Result<Vec<InternedId>> {
        let query = match kind {
            SequenceKind::SqlStackFrame => {
                "SELECT frame_id FROM sql_event_frames WHERE event_id = ?1 ORDER BY position ASC"
            }
            SequenceKind::SqlArgument => {
                "SELECT argument_id FROM sql_event_arguments WHERE event_id = ?1 ORDER BY position ASC"
            }
        };

        let mut stmt = self.conn.prepare_cached(query)?;
        let rows = stmt.query_map(params![event_id.0], |row| row.get(0).map(InternedId))?;
        collect_rows(rows)
    }

    /// Attaches `(key, value)` to an event. Returns `false` when the event
    /// already carried that exact pair.
    pub fn tag_event(
        &mut self,
        kind: EventKind,
        event_id: EventId,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tag transaction")?;

        if !event_exists(&tx, kind, event_id)? {
            return Err(anyhow!("{kind} event {event_id} not found"));
        }

        let attached = attach_tag(&tx, kind, event_id, key, value)?;
        tx.commit().context("failed to commit tag transaction")?;
        Ok(attached)
    }

    /// Resolves the sender and writes every valid event of `batch` in one
    /// transaction. Invalid events are reported and skipped; a storage error
    /// rolls back the whole batch.
    pub fn push_batch(&mut self, batch: &BatchPayload) -> Result<BatchReport> {
        batch
            .sender
            .validate()
            .map_err(|err| anyhow!("batch rejected: {err}"))?;

        let batch_id = Ulid::new();
        let received_at =
            format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start batch transaction")?;

        let written = write_batch(&tx, batch, batch_id, &received_at);
        let (sender_id, events, rejections) = match written {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    batch_id = %batch_id,
                    sender = %batch.sender.name,
                    error = %err,
                    "rolling back ingest batch"
                );
                return Err(err);
            }
        };

        tx.commit().context("failed to commit batch transaction")?;

        info!(
            batch_id = %batch_id,
            sender = %batch.sender.name,
            accepted = events.len(),
            rejected = rejections.len(),
            "committed ingest batch"
        );

        Ok(BatchReport {
            batch_id,
            sender_id,
            accepted: events.len(),
            rejected: rejections.len(),
            events,
            rejections,
        })
    }

    pub fn get_call_stack(&self, id: EventId) -> Result<Option<CallStackRecord>> {
        let query = format!("{SELECT_CALL_STACK} WHERE e.event_id = ?1");
        let record = self
            .conn
            .query_row(&query, params![id.0], parse_call_stack_row)
            .optional()
            .context("failed to load call stack event")?;

        record.map(|item| self.with_call_stack_items(item)).transpose()
    }

    pub fn get_sql_statement(&self, id: EventId) -> Result<Option<SqlStatementRecord>> {
        let query = format!("{SELECT_SQL_STATEMENT} WHERE e.event_id = ?1");
        let record = self
            .conn
            .query_row(&query, params![id.0], parse_sql_statement_row)
            .optional()
            .context("failed to load sql event")?;

        record.map(|item| self.with_sql_sequences(item)).transpose()
    }

    pub fn get_file_access(&self, id: EventId) -> Result<Option<FileAccessRecord>> {
        let query = format!("{SELECT_FILE_ACCESS} WHERE e.event_id = ?1");
        self.conn
            .query_row(&query, params![id.0], parse_file_access_row)
            .optional()
            .context("failed to load file access event")
    }

    /// Stack frames active when the statement ran, in captured order.
    pub fn sql_stack(&self, event_id: EventId) -> Result<Vec<StackFrame>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT f.module, f.function
             FROM sql_event_frames s
             JOIN stack_frames f ON f.frame_id = s.frame_id
             WHERE s.event_id = ?1
             ORDER BY s.position ASC",
        )?;
        let rows = stmt.query_map(params![event_id.0], |row| {
            Ok(StackFrame {
                module: row.get(0)?,
                function: row.get(1)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Bound argument values in statement order.
    pub fn sql_arguments(&self, event_id: EventId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.text
             FROM sql_event_arguments a
             JOIN interned_strings t ON t.string_id = a.argument_id
             WHERE a.event_id = ?1
             ORDER BY a.position ASC",
        )?;
        let rows = stmt.query_map(params![event_id.0], |row| row.get(0))?;
        collect_rows(rows)
    }

    pub fn get_sender(&self, id: SenderId) -> Result<Option<SenderRecord>> {
        self.conn
            .query_row(
                "SELECT sender_id, name, address, created_at FROM senders WHERE sender_id = ?1",
                params![id.0],
                parse_sender_row,
            )
            .optional()
            .context("failed to load sender")
    }

    fn with_call_stack_items(&self, mut record: CallStackRecord) -> Result<CallStackRecord> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT module, function, line_number, total_calls, native_calls,
                    cumulative_time, total_time
             FROM call_stack_items
             WHERE event_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![record.id.0], |row| {
            Ok(CallStackItem {
                module: row.get(0)?,
                function: row.get(1)?,
                line: row.get(2)?,
                total_calls: row.get(3)?,
                native_calls: row.get(4)?,
                cumulative_time: row.get(5)?,
                total_time: row.get(6)?,
            })
        })?;
        record.items = collect_rows(rows)?;
        Ok(record)
    }

    fn with_sql_sequences(&self, mut record: SqlStatementRecord) -> Result<SqlStatementRecord> {
        record.stack = self.sql_stack(record.id)?;
        record.args = self.sql_arguments(record.id)?;
        Ok(record)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ProfileStore for SqliteProfileStore {
    fn push_batch(&mut self, batch: &BatchPayload) -> Result<BatchReport> {
        SqliteProfileStore::push_batch(self, batch)
    }

    fn get_event(&self, kind: EventKind, id: EventId) -> Result<Option<EventRecord>> {
        let record = match kind {
            EventKind::CallStack => self.get_call_stack(id)?.map(EventRecord::CallStack),
            EventKind::SqlStatement => self.get_sql_statement(id)?.map(EventRecord::SqlStatement),
            EventKind::FileAccess => self.get_file_access(id)?.map(EventRecord::FileAccess),
        };
        Ok(record)
    }

    fn list_events(&self, kind: EventKind, limit: Option<usize>) -> Result<Vec<EventRecord>> {
        let base = match kind {
            EventKind::CallStack => SELECT_CALL_STACK,
            EventKind::SqlStatement => SELECT_SQL_STATEMENT,
            EventKind::FileAccess => SELECT_FILE_ACCESS,
        };
        let mut query = format!("{base} ORDER BY e.event_id ASC");
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        match kind {
            EventKind::CallStack => {
                let rows = stmt.query_map([], parse_call_stack_row)?;
                collect_rows(rows)?
                    .into_iter()
                    .map(|record| {
                        self.with_call_stack_items(record)
                            .map(EventRecord::CallStack)
                    })
                    .collect()
            }
            EventKind::SqlStatement => {
                let rows = stmt.query_map([], parse_sql_statement_row)?;
                collect_rows(rows)?
                    .into_iter()
                    .map(|record| {
                        self.with_sql_sequences(record)
                            .map(EventRecord::SqlStatement)
                    })
                    .collect()
            }
            EventKind::FileAccess => {
                let rows = stmt.query_map([], parse_file_access_row)?;
                Ok(collect_rows(rows)?
                    .into_iter()
                    .map(EventRecord::FileAccess)
                    .collect())
            }
        }
    }

    fn pivot_metadata(
        &self,
        kind: EventKind,
        id: EventId,
    ) -> Result<BTreeMap<String, MetadataValue>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.key, t.value
             FROM event_tags et
             JOIN metadata_tags t ON t.tag_id = et.tag_id
             WHERE et.event_kind = ?1 AND et.event_id = ?2
             ORDER BY et.position ASC",
        )?;
        let rows = stmt.query_map(params![kind.as_str(), id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(pivot_tags(collect_rows(rows)?))
    }

    fn distinct_metadata_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key FROM metadata_tags GROUP BY key ORDER BY MIN(tag_id) ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut keys = collect_rows(rows)?;
        sort_case_insensitive(&mut keys);
        Ok(keys)
    }

    fn metadata_values(&self, filter: &MetadataFilter) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT value FROM metadata_tags
             WHERE key = ?1 AND (?2 IS NULL OR value = ?2)
             ORDER BY tag_id ASC",
        )?;
        let rows = stmt.query_map(params![filter.key, filter.value], |row| row.get(0))?;
        let mut values = collect_rows(rows)?;
        sort_case_insensitive(&mut values);
        Ok(values)
    }

    fn list_senders(&self) -> Result<Vec<SenderRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT sender_id, name, address, created_at FROM senders ORDER BY sender_id ASC",
        )?;
        let rows = stmt.query_map([], parse_sender_row)?;
        collect_rows(rows)
    }

    fn list_batches(&self, limit: Option<usize>) -> Result<Vec<BatchRecord>> {
        let mut query = "SELECT batch_id, sender_id, accepted, rejected, received_at
             FROM ingest_batches
             ORDER BY rowid ASC"
            .to_string();
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            let batch_id_raw: String = row.get(0)?;
            let received_at_raw: String = row.get(4)?;
            Ok(BatchRecord {
                batch_id: parse_ulid(0, &batch_id_raw)?,
                sender_id: SenderId(row.get(1)?),
                accepted: parse_count(2, row.get(2)?)?,
                rejected: parse_count(3, row.get(3)?)?,
                received_at: parse_timestamp(4, &received_at_raw)?,
            })
        })?;
        collect_rows(rows)
    }
}

type WrittenBatch = (SenderId, Vec<EventRef>, Vec<EventRejection>);

fn write_batch(
    conn: &Connection,
    batch: &BatchPayload,
    batch_id: Ulid,
    received_at: &str,
) -> Result<WrittenBatch> {
    let sender_id = resolve_sender(conn, &batch.sender, received_at)?;
    conn.execute(
        "INSERT INTO ingest_batches(batch_id, sender_id, accepted, rejected, received_at)
         VALUES (?1, ?2, 0, 0, ?3)",
        params![batch_id.to_string(), sender_id.0, received_at],
    )
    .context("failed to register ingest batch")?;

    let context = BatchContext {
        batch_id,
        sender_id,
        recorded_at: received_at,
    };

    let mut events = Vec::new();
    let mut rejections = Vec::new();
    for (index, raw) in batch.events.iter().enumerate() {
        match EventPayload::decode(raw) {
            Ok(payload) => {
                let id = record_event(conn, &context, &payload)
                    .with_context(|| format!("failed to store event #{index}"))?;
                events.push(EventRef {
                    kind: payload.kind(),
                    id,
                });
            }
            Err(err) => {
                debug!(batch_id = %batch_id, index, error = %err, "rejected event");
                rejections.push(EventRejection {
                    index,
                    kind: kind_hint(raw),
                    reason: err.to_string(),
                });
            }
        }
    }

    conn.execute(
        "UPDATE ingest_batches SET accepted = ?2, rejected = ?3 WHERE batch_id = ?1",
        params![
            batch_id.to_string(),
            i64::try_from(events.len()).context("accepted count overflow")?,
            i64::try_from(rejections.len()).context("rejected count overflow")?,
        ],
    )
    .context("failed to record batch counts")?;

    Ok((sender_id, events, rejections))
}

fn record_event(conn: &Connection, context: &BatchContext<'_>, payload: &EventPayload) -> Result<EventId> {
    let event_id = match payload {
        EventPayload::CallStack(call_stack) => record_call_stack(conn, context, call_stack)?,
        EventPayload::SqlStatement(statement) => record_sql_statement(conn, context, statement)?,
        EventPayload::FileAccess(access) => record_file_access(conn, context, access)?,
    };

    let kind = payload.kind();
    for tag in payload.metadata() {
        attach_tag(conn, kind, event_id, &tag.key, &tag.value)?;
    }

    Ok(event_id)
}

fn record_call_stack(
    conn: &Connection,
    context: &BatchContext<'_>,
    payload: &CallStackPayload,
) -> Result<EventId> {
    let call_name_id = intern_call_name(conn, &payload.call)?;

    conn.prepare_cached(
        "INSERT INTO call_stack_events(
            batch_id, sender_id, call_name_id, occurred_at, duration, sample_ref, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        context.batch_id.to_string(),
        context.sender_id.0,
        call_name_id.0,
        payload.datetime,
        payload.duration,
        payload.sample_ref,
        context.recorded_at,
    ])
    .context("failed to insert call stack event")?;
    let event_id = EventId(conn.last_insert_rowid());

    let mut stmt = conn.prepare_cached(
        "INSERT INTO call_stack_items(
            event_id, position, module, function, line_number,
            total_calls, native_calls, cumulative_time, total_time
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (position, item) in payload.items.iter().enumerate() {
        stmt.execute(params![
            event_id.0,
            i64::try_from(position).context("call stack item position overflow")?,
            item.module,
            item.function,
            item.line,
            item.total_calls,
            item.native_calls,
            item.cumulative_time,
            item.total_time,
        ])
        .context("failed to insert call stack item")?;
    }

    Ok(event_id)
}

fn record_sql_statement(
    conn: &Connection,
    context: &BatchContext<'_>,
    payload: &SqlStatementPayload,
) -> Result<EventId> {
    let sql_text_id = intern_string(conn, ScopeKind::SqlText, &payload.sql)?;

    conn.prepare_cached(
        "INSERT INTO sql_events(
            batch_id, sender_id, sql_text_id, occurred_at, duration, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        context.batch_id.to_string(),
        context.sender_id.0,
        sql_text_id.0,
        payload.datetime,
        payload.duration,
        context.recorded_at,
    ])
    .context("failed to insert sql event")?;
    let event_id = EventId(conn.last_insert_rowid());

    let frames = payload
        .stack
        .iter()
        .map(|frame| intern_stack_frame(conn, frame))
        .collect::<Result<Vec<_>>>()?;
    insert_sequence(conn, event_id, SequenceKind::SqlStackFrame, &frames)?;

    let args = payload
        .args
        .iter()
        .map(|arg| intern_string(conn, ScopeKind::ArgumentValue, &argument_text(arg)))
        .collect::<Result<Vec<_>>>()?;
    insert_sequence(conn, event_id, SequenceKind::SqlArgument, &args)?;

    Ok(event_id)
}

fn record_file_access(
    conn: &Connection,
    context: &BatchContext<'_>,
    payload: &FileAccessPayload,
) -> Result<EventId> {
    let file_path_id = intern_string(conn, ScopeKind::FilePath, &payload.path)?;

    conn.prepare_cached(
        "INSERT INTO file_access_events(
            batch_id, sender_id, file_path_id, occurred_at, duration,
            time_to_open, bytes_written, mode, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        context.batch_id.to_string(),
        context.sender_id.0,
        file_path_id.0,
        payload.datetime,
        payload.duration,
        payload.time_to_open,
        payload.bytes_written,
        payload.mode,
        context.recorded_at,
    ])
    .context("failed to insert file access event")?;

    Ok(EventId(conn.last_insert_rowid()))
}

fn insert_sequence(
    conn: &Connection,
    event_id: EventId,
    kind: SequenceKind,
    items: &[InternedId],
) -> Result<()> {
    let query = match kind {
        SequenceKind::SqlStackFrame => {
            "INSERT INTO sql_event_frames(event_id, position, frame_id) VALUES (?1, ?2, ?3)"
        }
        SequenceKind::SqlArgument => {
            "INSERT INTO sql_event_arguments(event_id, position, argument_id) VALUES (?1, ?2, ?3)"
        }
    };

    let mut stmt = conn.prepare_cached(query)?;
    for (position, item) in items.iter().enumerate() {
        let position = i64::try_from(position).context("sequence position overflow")?;
        stmt.execute(params![event_id.0, position, item.0])
            .with_context(|| {
                format!(
                    "failed to attach {} #{position} to event {event_id}",
                    kind.as_str()
                )
            })?;
    }

    Ok(())
}

fn attach_tag(
    conn: &Connection,
    kind: EventKind,
    event_id: EventId,
    key: &str,
    value: &str,
) -> Result<bool> {
    validate_tag(kind, key).map_err(|err| anyhow!("tag rejected: {err}"))?;
    let tag_id = get_or_create(
        conn,
        "SELECT tag_id FROM metadata_tags WHERE key = ?1 AND value = ?2",
        params![key, value],
        "INSERT INTO metadata_tags(key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;

    let inserted = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO event_tags(event_kind, event_id, tag_id, position)
             SELECT ?1, ?2, ?3, COALESCE(MAX(position) + 1, 0)
             FROM event_tags
             WHERE event_kind = ?1 AND event_id = ?2",
        )?
        .execute(params![kind.as_str(), event_id.0, tag_id])
        .context("failed to attach metadata tag")?;

    Ok(inserted == 1)
}

fn event_exists(conn: &Connection, kind: EventKind, event_id: EventId) -> Result<bool> {
    let query = match kind {
        EventKind::CallStack => "SELECT 1 FROM call_stack_events WHERE event_id = ?1",
        EventKind::SqlStatement => "SELECT 1 FROM sql_events WHERE event_id = ?1",
        EventKind::FileAccess => "SELECT 1 FROM file_access_events WHERE event_id = ?1",
    };
    let exists = conn
        .query_row(query, params![event_id.0], |_| Ok(()))
        .optional()
        .context("failed to check event existence")?
        .is_some();
    Ok(exists)
}

fn resolve_sender(conn: &Connection, sender: &SenderPayload, created_at: &str) -> Result<SenderId> {
    get_or_create(
        conn,
        "SELECT sender_id FROM senders WHERE name = ?1",
        params![sender.name],
        "INSERT INTO senders(name, address, created_at) VALUES (?1, ?2, ?3)",
        params![sender.name, sender.address, created_at],
    )
    .map(SenderId)
}

fn intern_string(conn: &Connection, scope: ScopeKind, text: &str) -> Result<InternedId> {
    let scope = scope.as_str();
    get_or_create(
        conn,
        "SELECT string_id FROM interned_strings WHERE scope = ?1 AND text = ?2",
        params![scope, text],
        "INSERT INTO interned_strings(scope, text) VALUES (?1, ?2)",
        params![scope, text],
    )
    .map(InternedId)
}

fn intern_stack_frame(conn: &Connection, frame: &StackFrame) -> Result<InternedId> {
    get_or_create(
        conn,
        "SELECT frame_id FROM stack_frames WHERE module = ?1 AND function = ?2",
        params![frame.module, frame.function],
        "INSERT INTO stack_frames(module, function) VALUES (?1, ?2)",
        params![frame.module, frame.function],
    )
    .map(InternedId)
}

fn intern_call_name(conn: &Connection, call: &CallName) -> Result<InternedId> {
    let class_name = call.class_name.as_deref().unwrap_or("");
    get_or_create(
        conn,
        "SELECT call_name_id FROM call_names
         WHERE module = ?1 AND class_name = ?2 AND function = ?3",
        params![call.module, class_name, call.function],
        "INSERT INTO call_names(module, class_name, function) VALUES (?1, ?2, ?3)",
        params![call.module, class_name, call.function],
    )
    .map(InternedId)
}

/// Looks the row up first and inserts only when it is missing.
fn get_or_create(
    conn: &Connection,
    lookup_sql: &str,
    lookup: &[&dyn ToSql],
    insert_sql: &str,
    insert: &[&dyn ToSql],
) -> Result<i64> {
    if let Some(id) = lookup_id(conn, lookup_sql, lookup)? {
        return Ok(id);
    }
    insert_or_resolve(conn, lookup_sql, lookup, insert_sql, insert)
}

/// Inserts a new interned row. If another writer inserted the same value
/// first, the unique constraint fires and the winner's id is returned.
fn insert_or_resolve(
    conn: &Connection,
    lookup_sql: &str,
    lookup: &[&dyn ToSql],
    insert_sql: &str,
    insert: &[&dyn ToSql],
) -> Result<i64> {
    match conn.prepare_cached(insert_sql)?.execute(insert) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            debug!(statement = insert_sql, "unique conflict while interning, re-reading winner");
            lookup_id(conn, lookup_sql, lookup)?
                .ok_or_else(|| anyhow!("interned row missing after unique conflict"))
        }
        Err(err) => Err(err).context("failed to insert interned row"),
    }
}

fn lookup_id(conn: &Connection, lookup_sql: &str, lookup: &[&dyn ToSql]) -> Result<Option<i64>> {
    conn.prepare_cached(lookup_sql)?
        .query_row(lookup, |row| row.get(0))
        .optional()
        .context("failed to look up interned row")
}

fn parse_call_stack_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallStackRecord> {
    let batch_id_raw: String = row.get(2)?;
    let class_name: String = row.get(4)?;
    let recorded_at_raw: String = row.get(9)?;

    Ok(CallStackRecord {
        id: EventId(row.get(0)?),
        sender_id: SenderId(row.get(1)?),
        batch_id: parse_ulid(2, &batch_id_raw)?,
        call: CallName {
            module: row.get(3)?,
            class_name: (!class_name.is_empty()).then_some(class_name),
            function: row.get(5)?,
        },
        datetime: row.get(6)?,
        duration: row.get(7)?,
        sample_ref: row.get(8)?,
        items: Vec::new(),
        recorded_at: parse_timestamp(9, &recorded_at_raw)?,
    })
}

fn parse_sql_statement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SqlStatementRecord> {
    let batch_id_raw: String = row.get(2)?;
    let recorded_at_raw: String = row.get(6)?;

    Ok(SqlStatementRecord {
        id: EventId(row.get(0)?),
        sender_id: SenderId(row.get(1)?),
        batch_id: parse_ulid(2, &batch_id_raw)?,
        sql: row.get(3)?,
        datetime: row.get(4)?,
        duration: row.get(5)?,
        stack: Vec::new(),
        args: Vec::new(),
        recorded_at: parse_timestamp(6, &recorded_at_raw)?,
    })
}

fn parse_file_access_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileAccessRecord> {
    let batch_id_raw: String = row.get(2)?;
    let recorded_at_raw: String = row.get(9)?;

    Ok(FileAccessRecord {
        id: EventId(row.get(0)?),
        sender_id: SenderId(row.get(1)?),
        batch_id: parse_ulid(2, &batch_id_raw)?,
        path: row.get(3)?,
        datetime: row.get(4)?,
        duration: row.get(5)?,
        time_to_open: row.get(6)?,
        bytes_written: row.get(7)?,
        mode: row.get(8)?,
        recorded_at: parse_timestamp(9, &recorded_at_raw)?,
    })
}

fn parse_sender_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SenderRecord> {
    let created_at_raw: String = row.get(3)?;
    Ok(SenderRecord {
        id: SenderId(row.get(0)?),
        name: row.get(1)?,
        address: row.get(2)?,
        created_at: parse_timestamp(3, &created_at_raw)?,
    })
}

fn parse_ulid(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            format!("invalid ULID: {raw}"),
        )
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(column, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_count(column: usize, raw: i64) -> rusqlite::Result<usize> {
    usize::try_from(raw).map_err(|_| {
        conversion_error(
            column,
            rusqlite::types::Type::Integer,
            format!("invalid count: {raw}"),
        )
    })
}

fn conversion_error(
    column: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::thread;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_store() -> SqliteProfileStore {
        let store = must(SqliteProfileStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("profile-store-{label}-{}.sqlite3", Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut target = path.as_os_str().to_owned();
            target.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(target));
        }
    }

    fn count(store: &SqliteProfileStore, table: &str) -> i64 {
        match store
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        {
            Ok(value) => value,
            Err(err) => panic!("failed to count {table}: {err}"),
        }
    }

    fn sql_event(sql: &str, args: &[&str]) -> Value {
        json!({
            "kind": "sql_statement",
            "sql": sql,
            "datetime": 1_700_000_000.5,
            "duration": 0.002,
            "stack": [
                {"module": "app/server.py", "function": "handle"},
                {"module": "app/orm.py", "function": "execute"}
            ],
            "args": args,
        })
    }

    fn file_event(path: &str, bytes_written: i64) -> Value {
        json!({
            "kind": "file_access",
            "path": path,
            "datetime": 1_700_000_001.0,
            "duration": 0.01,
            "time_to_open": 0.001,
            "bytes_written": bytes_written,
            "mode": "w",
        })
    }

    fn call_stack_event() -> Value {
        json!({
            "kind": "call_stack",
            "call": {"module": "shop.cart", "class": "Cart", "function": "checkout"},
            "datetime": 1_700_000_002.0,
            "duration": 0.3,
            "sample_ref": "samples/01.pstats",
            "items": [
                {
                    "module": "shop/cart.py",
                    "function": "checkout",
                    "line": 42,
                    "total_calls": 3,
                    "native_calls": 1,
                    "cumulative_time": 0.3,
                    "total_time": 0.1
                },
                {
                    "module": "shop/tax.py",
                    "function": "compute",
                    "line": 7,
                    "total_calls": 3,
                    "native_calls": 3,
                    "cumulative_time": 0.2,
                    "total_time": 0.2
                }
            ],
            "metadata": [{"key": "env", "value": "prod"}]
        })
    }

    fn batch(sender: &str, address: &str, events: Vec<Value>) -> BatchPayload {
        BatchPayload {
            sender: SenderPayload {
                name: sender.to_string(),
                address: address.to_string(),
            },
            events,
        }
    }

    fn first_event(report: &BatchReport) -> EventId {
        must_some(report.events.first()).id
    }

    #[test]
    fn interning_is_idempotent_per_scope() {
        let store = fixture_store();

        let first = must(store.intern(ScopeKind::SqlText, "select 1"));
        let second = must(store.intern(ScopeKind::SqlText, "select 1"));
        let other_scope = must(store.intern(ScopeKind::ArgumentValue, "select 1"));

        assert_eq!(first, second);
        assert_ne!(first, other_scope);
        assert_eq!(count(&store, "interned_strings"), 2);
    }

    #[test]
    fn losing_insert_resolves_to_existing_row() {
        let store = fixture_store();
        let winner = must(store.intern(ScopeKind::FilePath, "/var/log/app.log"));

        // Simulates a writer that looked the value up before the winner's
        // commit and then tries to insert it.
        let resolved = must(insert_or_resolve(
            store.connection(),
            "SELECT string_id FROM interned_strings WHERE scope = ?1 AND text = ?2",
            params!["file_path", "/var/log/app.log"],
            "INSERT INTO interned_strings(scope, text) VALUES (?1, ?2)",
            params!["file_path", "/var/log/app.log"],
        ));

        assert_eq!(resolved, winner.0);
        assert_eq!(count(&store, "interned_strings"), 1);
    }

    #[test]
    fn non_unique_constraint_failures_are_surfaced() {
        let store = fixture_store();
        let result = insert_or_resolve(
            store.connection(),
            "SELECT string_id FROM interned_strings WHERE scope = ?1 AND text = ?2",
            params!["not_a_scope", "x"],
            "INSERT INTO interned_strings(scope, text) VALUES (?1, ?2)",
            params!["not_a_scope", "x"],
        );
        assert!(result.is_err());
    }

    #[test]
    fn concurrent_writers_intern_a_single_row() {
        let path = temp_db_path("intern-race");
        let setup = must(SqliteProfileStore::open(&path));
        must(setup.migrate());
        drop(setup);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut store = must(SqliteProfileStore::open(&path));
                    let mut ids = Vec::new();
                    for _ in 0..10 {
                        ids.push(must(store.intern(ScopeKind::SqlText, "select * from hot")));
                    }
                    let report = must(store.push_batch(&batch(
                        &format!("worker-{worker}"),
                        "10.0.0.1",
                        vec![sql_event("select * from hot", &["shared"])],
                    )));
                    assert_eq!(report.accepted, 1);
                    ids
                })
            })
            .collect();

        let mut all_ids = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(ids) => all_ids.extend(ids),
                Err(_) => panic!("worker thread panicked"),
            }
        }

        let store = must(SqliteProfileStore::open(&path));
        assert!(all_ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(
            count(&store, "interned_strings"),
            2,
            "one sql text and one argument value"
        );
        assert_eq!(count(&store, "sql_events"), 8);
        assert_eq!(count(&store, "stack_frames"), 2);
        drop(store);
        remove_db(&path);
    }

    #[test]
    fn sql_statement_reconstructs_with_arguments_and_stack() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select * from t where a=? and b=?", &["1", "2"])],
        )));
        let id = first_event(&report);

        let display = must_some(must(store.display_record(EventKind::SqlStatement, id)));
        assert_eq!(display["sql"], json!("select * from t where a=1 and b=2"));
        assert_eq!(display["args"], json!(["1", "2"]));
        assert_eq!(
            display["stack"],
            json!([
                {"module": "app/server.py", "function": "handle"},
                {"module": "app/orm.py", "function": "execute"}
            ])
        );

        let record = must_some(must(store.get_sql_statement(id)));
        assert_eq!(record.sql, "select * from t where a=? and b=?");
        assert_eq!(record.sender_id, report.sender_id);
        assert_eq!(record.batch_id, report.batch_id);
    }

    #[test]
    fn mismatched_argument_counts_substitute_partially() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![
                sql_event("a=? and b=?", &["1"]),
                sql_event("a=?", &["1", "2"]),
            ],
        )));

        let short = must_some(must(
            store.display_record(EventKind::SqlStatement, report.events[0].id),
        ));
        let long = must_some(must(
            store.display_record(EventKind::SqlStatement, report.events[1].id),
        ));

        assert_eq!(short["sql"], json!("a=1 and b=?"));
        assert_eq!(long["sql"], json!("a=1"));
    }

    #[test]
    fn repeated_values_share_interned_rows_across_events() {
        let mut store = fixture_store();
        let events = vec![
            sql_event("select * from users where id=?", &["7"]),
            sql_event("select * from users where id=?", &["7"]),
            sql_event("select * from users where id=?", &["8"]),
        ];
        let report = must(store.push_batch(&batch("host1", "10.0.0.1", events.clone())));
        assert_eq!(report.accepted, 3);

        // A client retry duplicates events but never interned values.
        must(store.push_batch(&batch("host1", "10.0.0.1", events)));

        assert_eq!(count(&store, "sql_events"), 6);
        assert_eq!(count(&store, "interned_strings"), 3);
        assert_eq!(count(&store, "stack_frames"), 2);
    }

    #[test]
    fn sequences_round_trip_in_attachment_order() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select ?, ?, ?", &["c", "a", "b"])],
        )));
        let id = first_event(&report);

        let args = must(store.sql_arguments(id));
        assert_eq!(args, vec!["c".to_string(), "a".to_string(), "b".to_string()]);

        let frame_ids = must(store.read_sequence(id, SequenceKind::SqlStackFrame));
        assert_eq!(frame_ids.len(), 2);
        let stack = must(store.sql_stack(id));
        assert_eq!(stack[0].function, "handle");
        assert_eq!(stack[1].function, "execute");
    }

    #[test]
    fn attach_sequence_rejects_a_second_sequence_at_the_same_positions() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select ?", &["x"])],
        )));
        let id = first_event(&report);
        let extra = must(store.intern(ScopeKind::ArgumentValue, "y"));

        assert!(store
            .attach_sequence(id, SequenceKind::SqlArgument, &[extra])
            .is_err());
        assert_eq!(must(store.sql_arguments(id)), vec!["x".to_string()]);
    }

    #[test]
    fn pivot_returns_scalar_for_one_value_and_list_for_many() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[]), sql_event("select 2", &[])],
        )));
        let single = report.events[0].id;
        let multiple = report.events[1].id;

        assert!(must(store.tag_event(EventKind::SqlStatement, single, "env", "prod")));
        assert!(must(store.tag_event(EventKind::SqlStatement, multiple, "env", "prod")));
        assert!(must(store.tag_event(EventKind::SqlStatement, multiple, "env", "staging")));

        let single_pivot = must(store.pivot_metadata(EventKind::SqlStatement, single));
        assert_eq!(
            single_pivot.get("env"),
            Some(&MetadataValue::Single("prod".to_string()))
        );

        let multiple_pivot = must(store.pivot_metadata(EventKind::SqlStatement, multiple));
        assert_eq!(
            multiple_pivot.get("env"),
            Some(&MetadataValue::Multiple(vec![
                "prod".to_string(),
                "staging".to_string()
            ]))
        );

        let display = must_some(must(store.display_record(EventKind::SqlStatement, multiple)));
        assert_eq!(display["env"], json!(["prod", "staging"]));
    }

    #[test]
    fn retagging_with_the_same_pair_is_a_no_op() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![file_event("/tmp/a", 10)],
        )));
        let id = first_event(&report);

        assert!(must(store.tag_event(EventKind::FileAccess, id, "team", "core")));
        assert!(!must(store.tag_event(EventKind::FileAccess, id, "team", "core")));

        assert_eq!(count(&store, "event_tags"), 1);
        assert_eq!(count(&store, "metadata_tags"), 1);
        assert_eq!(
            must(store.pivot_metadata(EventKind::FileAccess, id)).get("team"),
            Some(&MetadataValue::Single("core".to_string()))
        );
    }

    #[test]
    fn tagging_guards_reserved_keys_and_missing_events() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[])],
        )));
        let id = first_event(&report);

        assert!(store
            .tag_event(EventKind::SqlStatement, id, "args", "x")
            .is_err());
        assert!(store
            .tag_event(EventKind::SqlStatement, EventId(999), "env", "prod")
            .is_err());
        assert!(store
            .tag_event(EventKind::FileAccess, id, "env", "prod")
            .is_err());
        assert_eq!(count(&store, "event_tags"), 0);
    }

    #[test]
    fn malformed_event_is_rejected_without_aborting_the_batch() {
        let mut store = fixture_store();
        let mut malformed = sql_event("select 3", &[]);
        if let Some(object) = malformed.as_object_mut() {
            object.remove("duration");
        }

        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![
                sql_event("select 1", &[]),
                file_event("/tmp/b", 1),
                malformed,
                call_stack_event(),
                sql_event("select 5", &[]),
            ],
        )));

        assert_eq!(report.accepted, 4);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.rejections[0].index, 2);
        assert_eq!(report.rejections[0].kind, Some(EventKind::SqlStatement));

        let visible: usize = EventKind::ALL
            .iter()
            .map(|kind| must(store.list_events(*kind, None)).len())
            .sum();
        assert_eq!(visible, 4);

        let batches = must(store.list_batches(None));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].accepted, 4);
        assert_eq!(batches[0].rejected, 1);
    }

    #[test]
    fn storage_failure_rolls_back_the_whole_batch() {
        let mut store = fixture_store();
        must(
            store
                .connection()
                .execute_batch(
                    "CREATE TRIGGER trg_inject_failure
                     BEFORE INSERT ON file_access_events
                     WHEN NEW.bytes_written = 666
                     BEGIN
                       SELECT RAISE(ABORT, 'injected storage failure');
                     END;",
                )
                .map_err(anyhow::Error::from),
        );

        let result = store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![
                sql_event("select 1", &["a"]),
                call_stack_event(),
                file_event("/tmp/c", 666),
                sql_event("select 2", &[]),
            ],
        ));

        assert!(result.is_err());
        for table in [
            "senders",
            "ingest_batches",
            "sql_events",
            "call_stack_events",
            "file_access_events",
            "interned_strings",
            "metadata_tags",
            "event_tags",
        ] {
            assert_eq!(count(&store, table), 0, "{table} should be empty");
        }
    }

    #[test]
    fn sender_keeps_first_seen_address() {
        let mut store = fixture_store();
        let first = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[])],
        )));
        let second = must(store.push_batch(&batch(
            "host1",
            "10.0.0.99",
            vec![sql_event("select 1", &[])],
        )));

        assert_eq!(first.sender_id, second.sender_id);
        let sender = must_some(must(store.get_sender(first.sender_id)));
        assert_eq!(sender.address, "10.0.0.1");
        assert_eq!(must(store.list_senders()).len(), 1);
        assert_eq!(must(store.list_batches(None)).len(), 2);
    }

    #[test]
    fn blank_sender_rejects_the_batch() {
        let mut store = fixture_store();
        let result = store.push_batch(&batch(" ", "10.0.0.1", vec![sql_event("select 1", &[])]));
        assert!(result.is_err());
        assert_eq!(count(&store, "sql_events"), 0);
    }

    #[test]
    fn distinct_keys_sort_case_insensitively() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[])],
        )));
        let id = first_event(&report);

        must(store.tag_event(EventKind::SqlStatement, id, "a", "x"));
        must(store.tag_event(EventKind::SqlStatement, id, "A", "y"));
        must(store.tag_event(EventKind::SqlStatement, id, "b", "z"));

        assert_eq!(
            must(store.distinct_metadata_keys()),
            vec!["a".to_string(), "A".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn metadata_values_filter_by_key_and_value() {
        let mut store = fixture_store();
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[]), file_event("/tmp/d", 0)],
        )));

        must(store.tag_event(EventKind::SqlStatement, report.events[0].id, "env", "staging"));
        must(store.tag_event(EventKind::SqlStatement, report.events[0].id, "env", "Prod"));
        must(store.tag_event(EventKind::FileAccess, report.events[1].id, "env", "dev"));
        must(store.tag_event(EventKind::FileAccess, report.events[1].id, "team", "core"));

        let all_env = must(store.metadata_values(&MetadataFilter {
            key: "env".to_string(),
            value: None,
        }));
        assert_eq!(
            all_env,
            vec!["dev".to_string(), "Prod".to_string(), "staging".to_string()]
        );

        let exact = must(store.metadata_values(&MetadataFilter {
            key: "env".to_string(),
            value: Some("dev".to_string()),
        }));
        assert_eq!(exact, vec!["dev".to_string()]);

        let missing = must(store.metadata_values(&MetadataFilter {
            key: "ENV".to_string(),
            value: None,
        }));
        assert!(missing.is_empty());
    }

    #[test]
    fn missing_event_is_distinct_from_empty_listing() {
        let store = fixture_store();
        assert!(must(store.get_event(EventKind::FileAccess, EventId(1))).is_none());
        assert!(must(store.display_record(EventKind::FileAccess, EventId(1))).is_none());
        assert!(must(store.list_events(EventKind::FileAccess, None)).is_empty());
    }

    #[test]
    fn call_stack_records_keep_items_and_call_name() {
        let mut store = fixture_store();
        let mut without_class = call_stack_event();
        without_class["call"] = json!({"module": "shop.cart", "function": "checkout"});
        let report = must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![call_stack_event(), call_stack_event(), without_class],
        )));
        assert_eq!(report.accepted, 3);
        assert_eq!(count(&store, "call_names"), 2);

        let record = must_some(must(store.get_call_stack(report.events[0].id)));
        assert_eq!(record.call.display_name(), "shop.cart.Cart: checkout");
        assert_eq!(record.items.len(), 2);
        assert_eq!(record.items[1].function, "compute");

        let bare = must_some(must(store.get_call_stack(report.events[2].id)));
        assert_eq!(bare.call.class_name, None);

        let display = must_some(must(
            store.display_record(EventKind::CallStack, report.events[2].id),
        ));
        assert_eq!(display["call"], json!("shop.cart.checkout"));
        assert_eq!(display["env"], json!("prod"));
    }

    #[test]
    fn list_events_respects_limit_and_order() {
        let mut store = fixture_store();
        must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![
                file_event("/tmp/1", 1),
                file_event("/tmp/2", 2),
                file_event("/tmp/1", 3),
            ],
        )));

        let listed = must(store.list_events(EventKind::FileAccess, Some(2)));
        assert_eq!(listed.len(), 2);
        assert!(listed[0].id() < listed[1].id());
        assert_eq!(count(&store, "interned_strings"), 2);
    }

    #[test]
    fn deleting_an_event_drops_owned_associations_only() {
        let mut store = fixture_store();
        let mut tagged = sql_event("select ?", &["v"]);
        tagged["metadata"] = json!([{"key": "env", "value": "prod"}]);
        let report = must(store.push_batch(&batch("host1", "10.0.0.1", vec![tagged])));
        let id = first_event(&report);

        let deleted = store
            .connection()
            .execute("DELETE FROM sql_events WHERE event_id = ?1", params![id.0]);
        assert!(deleted.is_ok());

        assert_eq!(count(&store, "sql_event_frames"), 0);
        assert_eq!(count(&store, "sql_event_arguments"), 0);
        assert_eq!(count(&store, "event_tags"), 0);
        assert_eq!(count(&store, "interned_strings"), 2);
        assert_eq!(count(&store, "metadata_tags"), 1);
    }

    #[test]
    fn referenced_interned_rows_cannot_be_deleted_or_updated() {
        let mut store = fixture_store();
        must(store.push_batch(&batch(
            "host1",
            "10.0.0.1",
            vec![sql_event("select 1", &[])],
        )));

        let delete = store
            .connection()
            .execute("DELETE FROM interned_strings WHERE scope = 'sql_text'", []);
        assert!(delete.is_err());

        let update = store
            .connection()
            .execute("UPDATE interned_strings SET text = 'select 2'", []);
        assert!(update.is_err());

        let mutate_event = store
            .connection()
            .execute("UPDATE sql_events SET duration = 9.0", []);
        assert!(mutate_event.is_err());
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(count(&store, "schema_migrations"), 1);
    }

    #[test]
    fn open_fails_for_unreachable_path() {
        let path = std::env::temp_dir()
            .join(format!("profile-store-missing-{}", Ulid::new()))
            .join("nested")
            .join("db.sqlite3");
        assert!(SqliteProfileStore::open(&path).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sequence_round_trip_preserves_order(
            values in prop::collection::vec("[a-z]{1,4}", 0..200),
        ) {
            let mut store = fixture_store();
            let report = must(store.push_batch(&batch(
                "host1",
                "10.0.0.1",
                vec![sql_event("select 1", &[])],
            )));
            let id = first_event(&report);

            // The event was stored without arguments.
            let interned = values
                .iter()
                .map(|value| must(store.intern(ScopeKind::ArgumentValue, value)))
                .collect::<Vec<_>>();
            must(store.attach_sequence(id, SequenceKind::SqlArgument, &interned));

            prop_assert_eq!(must(store.read_sequence(id, SequenceKind::SqlArgument)), interned);
            prop_assert_eq!(must(store.sql_arguments(id)), values);
        }
    }
}
