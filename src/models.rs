use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Authenticated user reference. Every query and write is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> AppResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("identity cannot be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Task,
    Project,
    Transaction,
    Note,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [Self::Task, Self::Project, Self::Transaction, Self::Note];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Transaction => "transaction",
            Self::Note => "note",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Project => "projects",
            Self::Transaction => "transactions",
            Self::Note => "notes",
        }
    }
}

/// Per-user collection location: `/artifacts/{app_id}/users/{identity}/{collection}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(app_id: &str, identity: &Identity, kind: RecordKind) -> Self {
        Self(format!(
            "/artifacts/{}/users/{}/{}",
            app_id,
            identity.as_str(),
            kind.collection()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
        }
    }

    /// Anything not recognised as done or in progress is still open work.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "done" | "completed" | "selesai" => Self::Done,
            "in-progress" | "in_progress" | "doing" | "dikerjakan" => Self::InProgress,
            _ => Self::Todo,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "rendah" => Some(Self::Low),
            "medium" | "sedang" => Some(Self::Medium),
            "high" | "tinggi" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    Active,
    Done,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "done" | "completed" | "selesai" => Self::Done,
            _ => Self::Active,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "income" | "pemasukan" => Some(Self::Income),
            "expense" | "pengeluaran" => Some(Self::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoteCategory {
    Personal,
    Work,
    Study,
    Ideas,
    Other,
}

impl NoteCategory {
    pub const ALL: [NoteCategory; 5] = [
        Self::Personal,
        Self::Work,
        Self::Study,
        Self::Ideas,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Work => "work",
            Self::Study => "study",
            Self::Ideas => "ideas",
            Self::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Personal => "Personal",
            Self::Work => "Work",
            Self::Study => "Study",
            Self::Ideas => "Ideas",
            Self::Other => "Other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "personal" => Self::Personal,
            "work" => Self::Work,
            "study" => Self::Study,
            "ideas" => Self::Ideas,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Option<Priority>,
    pub deadline: Option<NaiveDate>,
    pub project_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub deadline: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub owner_id: String,
    pub description: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub category: String,
    pub date: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub content: String,
    pub category: NoteCategory,
    pub tags: Vec<String>,
    pub project_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Complete set of one kind of record as of one change notification.
///
/// Snapshots are replaced wholesale; the record buffer is shared, so cloning
/// is cheap and readers never observe a partially updated set.
///
/// `subscription` identifies the live subscription that produced the snapshot
/// (0 for one-off reads). Revisions only order snapshots of one subscription.
#[derive(Debug, Clone)]
pub struct Snapshot<R> {
    owner: Identity,
    subscription: u64,
    revision: u64,
    records: Arc<[R]>,
    captured_at: DateTime<Utc>,
}

impl<R> Snapshot<R> {
    pub fn new(owner: Identity, revision: u64, records: Vec<R>) -> Self {
        Self {
            owner,
            subscription: 0,
            revision,
            records: records.into(),
            captured_at: Utc::now(),
        }
    }

    pub fn empty(owner: Identity) -> Self {
        Self::new(owner, 0, Vec::new())
    }

    pub fn from_subscription(mut self, subscription: u64) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn subscription(&self) -> u64 {
        self.subscription
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.records.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub title: String,
    pub deadline: Option<NaiveDate>,
    pub priority: Option<Priority>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectPayload {
    pub name: String,
    pub description: Option<String>,
    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionPayload {
    pub description: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub category: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveNotePayload {
    pub title: String,
    pub content: String,
    pub category: NoteCategory,
    /// Comma separated, as typed into the note form.
    pub tags: String,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub app_id: String,
    pub suggestion_endpoint: String,
    pub suggestion_api_key: Option<String>,
    pub suggestion_timeout_ms: u64,
    pub recent_tasks_limit: usize,
    pub active_projects_limit: usize,
    pub recent_transactions_limit: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_id: "study-desk".to_string(),
            suggestion_endpoint:
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
                    .to_string(),
            suggestion_api_key: None,
            suggestion_timeout_ms: 20_000,
            recent_tasks_limit: 5,
            active_projects_limit: 3,
            recent_transactions_limit: 5,
        }
    }
}
