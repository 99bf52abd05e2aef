//! Total decoders from stored documents to typed records.
//!
//! Absent optional fields always decode to an explicit default. A document is
//! only rejected when a required field is missing or a field carries the wrong
//! JSON type; the caller skips such documents instead of failing the snapshot.

use crate::db::Document;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Note, NoteCategory, Priority, Project, ProjectStatus, RecordKind, Task, TaskStatus, Transaction,
    TransactionType,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

/// A record kind that can be materialized from a stored document.
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn decode(document: &Document) -> AppResult<Self>;

    fn id(&self) -> &str;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDocument {
    title: Option<String>,
    status: Option<String>,
    priority: Option<String>,
    deadline: Option<Value>,
    project_id: Option<String>,
    created_at: Option<Value>,
    completed_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDocument {
    name: Option<String>,
    title: Option<String>,
    description: Option<String>,
    status: Option<String>,
    deadline: Option<Value>,
    created_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDocument {
    description: Option<String>,
    amount: Option<f64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    category: Option<String>,
    date: Option<Value>,
    created_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteDocument {
    title: Option<String>,
    content: Option<String>,
    category: Option<String>,
    tags: Option<Value>,
    project_id: Option<String>,
    created_at: Option<Value>,
    updated_at: Option<Value>,
}

impl Record for Task {
    const KIND: RecordKind = RecordKind::Task;

    fn decode(document: &Document) -> AppResult<Self> {
        let raw: TaskDocument = parse_fields(document)?;
        Ok(Task {
            id: document.id.clone(),
            owner_id: document.owner_id.clone(),
            title: required(raw.title, "title", document)?,
            status: raw.status.as_deref().map(TaskStatus::parse).unwrap_or(TaskStatus::Todo),
            priority: raw.priority.as_deref().and_then(Priority::parse),
            deadline: raw.deadline.as_ref().and_then(parse_date),
            project_id: raw.project_id,
            created_at: raw.created_at.as_ref().and_then(parse_timestamp),
            completed_at: raw.completed_at.as_ref().and_then(parse_timestamp),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Project {
    const KIND: RecordKind = RecordKind::Project;

    fn decode(document: &Document) -> AppResult<Self> {
        let raw: ProjectDocument = parse_fields(document)?;
        Ok(Project {
            id: document.id.clone(),
            owner_id: document.owner_id.clone(),
            name: required(raw.name.or(raw.title), "name", document)?,
            description: raw.description.unwrap_or_default(),
            status: raw.status.as_deref().map(ProjectStatus::parse).unwrap_or(ProjectStatus::Active),
            deadline: raw.deadline.as_ref().and_then(parse_date),
            created_at: raw.created_at.as_ref().and_then(parse_timestamp),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Transaction {
    const KIND: RecordKind = RecordKind::Transaction;

    fn decode(document: &Document) -> AppResult<Self> {
        let raw: TransactionDocument = parse_fields(document)?;
        let raw_kind = required(raw.kind, "type", document)?;
        let kind = TransactionType::parse(&raw_kind).ok_or_else(|| {
            AppError::Decode(format!(
                "transaction {} has unknown type '{}'",
                document.id, raw_kind
            ))
        })?;
        let created_at = raw.created_at.as_ref().and_then(parse_timestamp);

        Ok(Transaction {
            id: document.id.clone(),
            owner_id: document.owner_id.clone(),
            description: raw.description.unwrap_or_default(),
            amount: raw.amount.unwrap_or(0.0),
            kind,
            category: raw.category.unwrap_or_default(),
            date: raw.date.as_ref().and_then(parse_timestamp).or(created_at),
            created_at,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Note {
    const KIND: RecordKind = RecordKind::Note;

    fn decode(document: &Document) -> AppResult<Self> {
        let raw: NoteDocument = parse_fields(document)?;
        Ok(Note {
            id: document.id.clone(),
            owner_id: document.owner_id.clone(),
            title: required(raw.title, "title", document)?,
            content: raw.content.unwrap_or_default(),
            category: raw.category.as_deref().map(NoteCategory::parse).unwrap_or(NoteCategory::Personal),
            tags: raw.tags.as_ref().map(parse_tags).unwrap_or_default(),
            project_id: raw.project_id,
            created_at: raw.created_at.as_ref().and_then(parse_timestamp),
            updated_at: raw.updated_at.as_ref().and_then(parse_timestamp),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

fn parse_fields<T: serde::de::DeserializeOwned>(document: &Document) -> AppResult<T> {
    serde_json::from_value(Value::Object(document.fields.clone()))
        .map_err(|error| AppError::Decode(format!("document {}: {}", document.id, error)))
}

fn required(value: Option<String>, field: &str, document: &Document) -> AppResult<String> {
    value.ok_or_else(|| {
        AppError::Decode(format!(
            "document {} is missing required field '{}'",
            document.id, field
        ))
    })
}

/// Accepts RFC 3339 strings, epoch milliseconds, and `{ seconds, nanoseconds }`
/// timestamp objects. Anything else is treated as absent.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        Value::Number(millis) => millis
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(map) => {
            let seconds = map.get("seconds").and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .and_then(Value::as_u64)
                .and_then(|nanos| u32::try_from(nanos).ok())
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos).single()
        }
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    if let Value::String(raw) = value {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(date);
        }
    }
    parse_timestamp(value).map(|timestamp| timestamp.date_naive())
}

fn parse_tags(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
