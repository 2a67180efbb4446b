//! Domain model for the interned profiling event store.
//!
//! Captured events arrive as a [`BatchPayload`]; each raw event is decoded into
//! an [`EventPayload`] and validated on its own so that one malformed event
//! cannot poison the rest of the batch. Stored events come back out as
//! [`EventRecord`]s and can be rendered into flat display maps with their
//! pivoted metadata merged in.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("metadata key `{key}` collides with a fixed {kind} field")]
    ReservedMetadataKey { kind: EventKind, key: String },
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EventId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct InternedId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SenderId(pub i64);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for InternedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SenderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace of an interned string. The same text interned under two scopes
/// yields two distinct rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    SqlText,
    FilePath,
    ArgumentValue,
}

impl ScopeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlText => "sql_text",
            Self::FilePath => "file_path",
            Self::ArgumentValue => "argument_value",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sql_text" => Some(Self::SqlText),
            "file_path" => Some(Self::FilePath),
            "argument_value" => Some(Self::ArgumentValue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CallStack,
    SqlStatement,
    FileAccess,
}

impl EventKind {
    pub const ALL: [Self; 3] = [Self::CallStack, Self::SqlStatement, Self::FileAccess];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallStack => "call_stack",
            Self::SqlStatement => "sql_statement",
            Self::FileAccess => "file_access",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "call_stack" => Some(Self::CallStack),
            "sql_statement" => Some(Self::SqlStatement),
            "file_access" => Some(Self::FileAccess),
            _ => None,
        }
    }

    /// Field names of this kind's display record. Metadata keys may not use
    /// them.
    #[must_use]
    pub fn reserved_fields(self) -> &'static [&'static str] {
        match self {
            Self::CallStack => &["id", "call", "datetime", "duration", "sample_ref", "items"],
            Self::SqlStatement => &["id", "sql", "datetime", "duration", "args", "stack"],
            Self::FileAccess => &[
                "id",
                "path",
                "datetime",
                "duration",
                "time_to_open",
                "bytes_written",
                "mode",
            ],
        }
    }

    #[must_use]
    pub fn is_reserved_field(self, key: &str) -> bool {
        self.reserved_fields().contains(&key)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered association families kept by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    SqlStackFrame,
    SqlArgument,
}

impl SequenceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlStackFrame => "sql_stack_frame",
            Self::SqlArgument => "sql_argument",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(deny_unknown_fields)]
pub struct StackFrame {
    pub module: String,
    pub function: String,
}

/// Fully-qualified callable identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(deny_unknown_fields)]
pub struct CallName {
    pub module: String,
    #[serde(rename = "class", default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub function: String,
}

impl CallName {
    /// `module.class: function` when a class is present, else
    /// `module.function`.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self.class_name.as_deref() {
            Some(class_name) => format!("{}.{}: {}", self.module, class_name, self.function),
            None => format!("{}.{}", self.module, self.function),
        }
    }
}

impl Display for CallName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Per-function profile statistics captured alongside a call-stack sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CallStackItem {
    pub module: String,
    pub function: String,
    pub line: i64,
    pub total_calls: i64,
    pub native_calls: i64,
    pub cumulative_time: f64,
    pub total_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TagPayload {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SenderPayload {
    pub name: String,
    pub address: String,
}

impl SenderPayload {
    /// # Errors
    /// Returns [`CoreError::Validation`] when the sender name is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation(
                "sender.name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// One submitted batch. Events stay as raw JSON until each one is decoded on
/// its own by [`EventPayload::decode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchPayload {
    pub sender: SenderPayload,
    pub events: Vec<Value>,
}

impl BatchPayload {
    /// Decodes a batch envelope from JSON text.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] when the envelope itself is malformed.
    /// Malformed individual events are not detected here.
    pub fn from_json_str(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::Decode(format!("invalid batch payload: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CallStackPayload {
    pub call: CallName,
    pub datetime: f64,
    pub duration: f64,
    pub sample_ref: String,
    #[serde(default)]
    pub items: Vec<CallStackItem>,
    #[serde(default)]
    pub metadata: Vec<TagPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SqlStatementPayload {
    pub sql: String,
    pub datetime: f64,
    pub duration: f64,
    pub stack: Vec<StackFrame>,
    pub args: Vec<Value>,
    #[serde(default)]
    pub metadata: Vec<TagPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileAccessPayload {
    pub path: String,
    pub datetime: f64,
    pub duration: f64,
    pub time_to_open: f64,
    pub bytes_written: i64,
    pub mode: String,
    #[serde(default)]
    pub metadata: Vec<TagPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    CallStack(CallStackPayload),
    SqlStatement(SqlStatementPayload),
    FileAccess(FileAccessPayload),
}

impl EventPayload {
    /// Decodes and validates one raw event.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] for unknown kinds, missing required
    /// fields or unknown fields, and the errors of [`EventPayload::validate`].
    pub fn decode(raw: &Value) -> Result<Self, CoreError> {
        let payload: Self = serde_json::from_value(raw.clone())
            .map_err(|err| CoreError::Decode(err.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CallStack(_) => EventKind::CallStack,
            Self::SqlStatement(_) => EventKind::SqlStatement,
            Self::FileAccess(_) => EventKind::FileAccess,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &[TagPayload] {
        match self {
            Self::CallStack(payload) => &payload.metadata,
            Self::SqlStatement(payload) => &payload.metadata,
            Self::FileAccess(payload) => &payload.metadata,
        }
    }

    /// Validates field contents beyond what decoding already enforces.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for blank identities, negative or
    /// non-finite timings and counts, and non-scalar SQL arguments; returns
    /// [`CoreError::ReservedMetadataKey`] when a tag key collides with a
    /// display field of this kind.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::CallStack(payload) => {
                require_text("call.module", &payload.call.module)?;
                require_text("call.function", &payload.call.function)?;
                if let Some(class_name) = payload.call.class_name.as_deref() {
                    require_text("call.class", class_name)?;
                }
                require_timing("datetime", payload.datetime)?;
                require_timing("duration", payload.duration)?;
                require_text("sample_ref", &payload.sample_ref)?;
                for (index, item) in payload.items.iter().enumerate() {
                    require_text(&format!("items[{index}].module"), &item.module)?;
                    require_text(&format!("items[{index}].function"), &item.function)?;
                    require_count(&format!("items[{index}].line"), item.line)?;
                    require_count(&format!("items[{index}].total_calls"), item.total_calls)?;
                    require_count(&format!("items[{index}].native_calls"), item.native_calls)?;
                    require_timing(
                        &format!("items[{index}].cumulative_time"),
                        item.cumulative_time,
                    )?;
                    require_timing(&format!("items[{index}].total_time"), item.total_time)?;
                }
            }
            Self::SqlStatement(payload) => {
                require_text("sql", &payload.sql)?;
                require_timing("datetime", payload.datetime)?;
                require_timing("duration", payload.duration)?;
                for (index, frame) in payload.stack.iter().enumerate() {
                    require_text(&format!("stack[{index}].module"), &frame.module)?;
                    require_text(&format!("stack[{index}].function"), &frame.function)?;
                }
                for (index, arg) in payload.args.iter().enumerate() {
                    if arg.is_array() || arg.is_object() {
                        return Err(CoreError::Validation(format!(
                            "args[{index}] MUST be a scalar value"
                        )));
                    }
                }
            }
            Self::FileAccess(payload) => {
                require_text("path", &payload.path)?;
                require_text("mode", &payload.mode)?;
                require_timing("datetime", payload.datetime)?;
                require_timing("duration", payload.duration)?;
                require_timing("time_to_open", payload.time_to_open)?;
                require_count("bytes_written", payload.bytes_written)?;
            }
        }

        let kind = self.kind();
        for tag in self.metadata() {
            validate_tag(kind, &tag.key)?;
        }

        Ok(())
    }
}

/// Reads the `kind` discriminator of a raw event, if it names a known kind.
#[must_use]
pub fn kind_hint(raw: &Value) -> Option<EventKind> {
    raw.get("kind")
        .and_then(Value::as_str)
        .and_then(EventKind::parse)
}

/// Checks a metadata key before it is attached to an event of `kind`.
///
/// # Errors
/// Returns [`CoreError::Validation`] for a blank key and
/// [`CoreError::ReservedMetadataKey`] for a key used by the display record.
pub fn validate_tag(kind: EventKind, key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::Validation(
            "metadata key MUST be non-empty".to_string(),
        ));
    }
    if kind.is_reserved_field(key) {
        return Err(CoreError::ReservedMetadataKey {
            kind,
            key: key.to_string(),
        });
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}

fn require_timing(field: &str, value: f64) -> Result<(), CoreError> {
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::Validation(format!(
            "{field} MUST be a finite, non-negative number"
        )));
    }
    Ok(())
}

fn require_count(field: &str, value: i64) -> Result<(), CoreError> {
    if value < 0 {
        return Err(CoreError::Validation(format!("{field} MUST be >= 0")));
    }
    Ok(())
}

/// Text form under which a bound SQL argument is interned.
#[must_use]
pub fn argument_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// Replaces each `?` in `sql`, left to right, with the next argument.
///
/// Surplus arguments are ignored and surplus placeholders stay as `?`.
/// Arguments are inserted verbatim: no quoting or escaping, and a `?` inside
/// an inserted argument is not treated as a placeholder.
#[must_use]
pub fn substitute_placeholders(sql: &str, args: &[String]) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut remaining = args.iter();

    for ch in sql.chars() {
        if ch == '?' {
            match remaining.next() {
                Some(arg) => output.push_str(arg),
                None => output.push(ch),
            }
        } else {
            output.push(ch);
        }
    }

    output
}

/// Pivoted value of one metadata key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Single(String),
    Multiple(Vec<String>),
}

impl MetadataValue {
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(value) => vec![value.as_str()],
            Self::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&MetadataValue> for Value {
    fn from(value: &MetadataValue) -> Self {
        match value {
            MetadataValue::Single(single) => Value::String(single.clone()),
            MetadataValue::Multiple(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

/// Groups `(key, value)` tags given in attachment order. A key with exactly
/// one value maps to [`MetadataValue::Single`], otherwise to
/// [`MetadataValue::Multiple`] in attachment order.
#[must_use]
pub fn pivot_tags<K, V>(tags: impl IntoIterator<Item = (K, V)>) -> BTreeMap<String, MetadataValue>
where
    K: Into<String>,
    V: Into<String>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in tags {
        grouped.entry(key.into()).or_default().push(value.into());
    }

    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let pivoted = if values.len() == 1 {
                MetadataValue::Single(values.remove(0))
            } else {
                MetadataValue::Multiple(values)
            };
            (key, pivoted)
        })
        .collect()
}

/// `key` or `key=value` selector over stored metadata tags.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetadataFilter {
    pub key: String,
    pub value: Option<String>,
}

impl MetadataFilter {
    /// # Errors
    /// Returns [`CoreError::Validation`] when the key part is empty.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let (key, value) = match raw.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (raw, None),
        };

        if key.is_empty() {
            return Err(CoreError::Validation(
                "metadata filter MUST be in <key>[=<value>] format".to_string(),
            ));
        }

        Ok(Self {
            key: key.to_string(),
            value,
        })
    }
}

/// Stable case-insensitive ascending sort; equal-ignoring-case entries keep
/// their incoming order.
pub fn sort_case_insensitive(values: &mut [String]) {
    values.sort_by_key(|value| value.to_lowercase());
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallStackRecord {
    pub id: EventId,
    pub sender_id: SenderId,
    pub batch_id: Ulid,
    pub call: CallName,
    pub datetime: f64,
    pub duration: f64,
    pub sample_ref: String,
    pub items: Vec<CallStackItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlStatementRecord {
    pub id: EventId,
    pub sender_id: SenderId,
    pub batch_id: Ulid,
    pub sql: String,
    pub datetime: f64,
    pub duration: f64,
    pub stack: Vec<StackFrame>,
    pub args: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl SqlStatementRecord {
    /// Statement text with the captured arguments substituted in.
    #[must_use]
    pub fn reconstructed_sql(&self) -> String {
        substitute_placeholders(&self.sql, &self.args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAccessRecord {
    pub id: EventId,
    pub sender_id: SenderId,
    pub batch_id: Ulid,
    pub path: String,
    pub datetime: f64,
    pub duration: f64,
    pub time_to_open: f64,
    pub bytes_written: i64,
    pub mode: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    CallStack(CallStackRecord),
    SqlStatement(SqlStatementRecord),
    FileAccess(FileAccessRecord),
}

impl EventRecord {
    #[must_use]
    pub fn id(&self) -> EventId {
        match self {
            Self::CallStack(record) => record.id,
            Self::SqlStatement(record) => record.id,
            Self::FileAccess(record) => record.id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CallStack(_) => EventKind::CallStack,
            Self::SqlStatement(_) => EventKind::SqlStatement,
            Self::FileAccess(_) => EventKind::FileAccess,
        }
    }

    /// Flattens the record into its presentation map and merges the pivoted
    /// metadata. Fixed fields always win over a colliding metadata key.
    #[must_use]
    pub fn display(&self, metadata: &BTreeMap<String, MetadataValue>) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::CallStack(record) => {
                map.insert("id".to_string(), Value::from(record.id.0));
                map.insert("call".to_string(), Value::from(record.call.display_name()));
                map.insert("datetime".to_string(), Value::from(record.datetime));
                map.insert("duration".to_string(), Value::from(record.duration));
                map.insert(
                    "sample_ref".to_string(),
                    Value::from(record.sample_ref.clone()),
                );
                map.insert(
                    "items".to_string(),
                    serde_json::to_value(&record.items).unwrap_or(Value::Null),
                );
            }
            Self::SqlStatement(record) => {
                map.insert("id".to_string(), Value::from(record.id.0));
                map.insert("sql".to_string(), Value::from(record.reconstructed_sql()));
                map.insert("datetime".to_string(), Value::from(record.datetime));
                map.insert("duration".to_string(), Value::from(record.duration));
                map.insert(
                    "args".to_string(),
                    Value::Array(record.args.iter().cloned().map(Value::String).collect()),
                );
                map.insert(
                    "stack".to_string(),
                    Value::Array(
                        record
                            .stack
                            .iter()
                            .map(|frame| {
                                serde_json::json!({
                                    "module": frame.module,
                                    "function": frame.function,
                                })
                            })
                            .collect(),
                    ),
                );
            }
            Self::FileAccess(record) => {
                map.insert("id".to_string(), Value::from(record.id.0));
                map.insert("path".to_string(), Value::from(record.path.clone()));
                map.insert("datetime".to_string(), Value::from(record.datetime));
                map.insert("duration".to_string(), Value::from(record.duration));
                map.insert("time_to_open".to_string(), Value::from(record.time_to_open));
                map.insert(
                    "bytes_written".to_string(),
                    Value::from(record.bytes_written),
                );
                map.insert("mode".to_string(), Value::from(record.mode.clone()));
            }
        }

        for (key, value) in metadata {
            if !map.contains_key(key) {
                map.insert(key.clone(), Value::from(value));
            }
        }

        map
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRef {
    pub kind: EventKind,
    pub id: EventId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRejection {
    pub index: usize,
    pub kind: Option<EventKind>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchReport {
    pub batch_id: Ulid,
    pub sender_id: SenderId,
    pub accepted: usize,
    pub rejected: usize,
    pub events: Vec<EventRef>,
    pub rejections: Vec<EventRejection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SenderRecord {
    pub id: SenderId,
    pub name: String,
    pub address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchRecord {
    pub batch_id: Ulid,
    pub sender_id: SenderId,
    pub accepted: usize,
    pub rejected: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// Write and read surface shared by store backends.
pub trait ProfileStore {
    #[allow(clippy::missing_errors_doc)]
    fn push_batch(&mut self, batch: &BatchPayload) -> anyhow::Result<BatchReport>;

    #[allow(clippy::missing_errors_doc)]
    fn get_event(&self, kind: EventKind, id: EventId) -> anyhow::Result<Option<EventRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, kind: EventKind, limit: Option<usize>)
        -> anyhow::Result<Vec<EventRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn pivot_metadata(
        &self,
        kind: EventKind,
        id: EventId,
    ) -> anyhow::Result<BTreeMap<String, MetadataValue>>;

    #[allow(clippy::missing_errors_doc)]
    fn display_record(
        &self,
        kind: EventKind,
        id: EventId,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        let Some(record) = self.get_event(kind, id)? else {
            return Ok(None);
        };
        let metadata = self.pivot_metadata(kind, id)?;
        Ok(Some(record.display(&metadata)))
    }

    #[allow(clippy::missing_errors_doc)]
    fn distinct_metadata_keys(&self) -> anyhow::Result<Vec<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn metadata_values(&self, filter: &MetadataFilter) -> anyhow::Result<Vec<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_senders(&self) -> anyhow::Result<Vec<SenderRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_batches(&self, limit: Option<usize>) -> anyhow::Result<Vec<BatchRecord>>;
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
