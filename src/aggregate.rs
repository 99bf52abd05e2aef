use crate::models::{Identity, Note, NoteCategory, Project, RecordKind, Snapshot, Task, Transaction, TransactionType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub productivity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinanceStats {
    pub income: f64,
    pub expense: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteStats {
    pub total: usize,
    pub by_category: BTreeMap<NoteCategory, usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub tasks: TaskStats,
    pub projects: ProjectStats,
    pub finances: FinanceStats,
    pub notes: NoteStats,
}

/// Latest snapshot per kind. A kind that has not delivered yet counts as empty.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSet {
    pub tasks: Option<Snapshot<Task>>,
    pub projects: Option<Snapshot<Project>>,
    pub transactions: Option<Snapshot<Transaction>>,
    pub notes: Option<Snapshot<Note>>,
}

#[derive(Debug, Clone)]
pub enum SnapshotUpdate {
    Tasks(Snapshot<Task>),
    Projects(Snapshot<Project>),
    Transactions(Snapshot<Transaction>),
    Notes(Snapshot<Note>),
}

impl SnapshotUpdate {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Tasks(_) => RecordKind::Task,
            Self::Projects(_) => RecordKind::Project,
            Self::Transactions(_) => RecordKind::Transaction,
            Self::Notes(_) => RecordKind::Note,
        }
    }

    pub fn owner(&self) -> &Identity {
        match self {
            Self::Tasks(snapshot) => snapshot.owner(),
            Self::Projects(snapshot) => snapshot.owner(),
            Self::Transactions(snapshot) => snapshot.owner(),
            Self::Notes(snapshot) => snapshot.owner(),
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            Self::Tasks(snapshot) => snapshot.revision(),
            Self::Projects(snapshot) => snapshot.revision(),
            Self::Transactions(snapshot) => snapshot.revision(),
            Self::Notes(snapshot) => snapshot.revision(),
        }
    }

    pub fn subscription(&self) -> u64 {
        match self {
            Self::Tasks(snapshot) => snapshot.subscription(),
            Self::Projects(snapshot) => snapshot.subscription(),
            Self::Transactions(snapshot) => snapshot.subscription(),
            Self::Notes(snapshot) => snapshot.subscription(),
        }
    }
}

/// Orders snapshots: a newer subscription always wins, and revisions only
/// compare within one subscription.
fn position<R>(snapshot: &Snapshot<R>) -> (u64, u64) {
    (snapshot.subscription(), snapshot.revision())
}

pub fn aggregate(snapshots: &SnapshotSet) -> AggregateResult {
    AggregateResult {
        tasks: task_stats(snapshots.tasks.as_ref().map(Snapshot::records).unwrap_or_default()),
        projects: project_stats(snapshots.projects.as_ref().map(Snapshot::records).unwrap_or_default()),
        finances: finance_stats(snapshots.transactions.as_ref().map(Snapshot::records).unwrap_or_default()),
        notes: note_stats(snapshots.notes.as_ref().map(Snapshot::records).unwrap_or_default()),
    }
}

pub fn task_stats(tasks: &[Task]) -> TaskStats {
    let total = tasks.len();
    let completed = tasks.iter().filter(|task| task.status.is_done()).count();
    TaskStats {
        total,
        completed,
        pending: total - completed,
        productivity: productivity(completed, total),
    }
}

pub fn project_stats(projects: &[Project]) -> ProjectStats {
    let total = projects.len();
    let completed = projects.iter().filter(|project| project.status.is_done()).count();
    ProjectStats {
        total,
        active: total - completed,
        completed,
    }
}

pub fn finance_stats(transactions: &[Transaction]) -> FinanceStats {
    let income = sum_of(transactions, TransactionType::Income);
    let expense = sum_of(transactions, TransactionType::Expense);
    FinanceStats {
        income,
        expense,
        balance: income - expense,
    }
}

pub fn note_stats(notes: &[Note]) -> NoteStats {
    let mut by_category = BTreeMap::new();
    for note in notes {
        *by_category.entry(note.category).or_insert(0) += 1;
    }
    NoteStats {
        total: notes.len(),
        by_category,
    }
}

/// Done tasks completed at or after `since`, in snapshot order.
pub fn completed_since(tasks: &[Task], since: DateTime<Utc>) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|task| task.status.is_done())
        .filter(|task| task.completed_at.is_some_and(|completed_at| completed_at >= since))
        .collect()
}

/// Completed share as a whole percentage, rounded half up. Zero tasks is 0%.
fn productivity(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let percent = (completed * 100 + total / 2) / total;
    u32::try_from(percent).unwrap_or(100)
}

fn sum_of(transactions: &[Transaction], kind: TransactionType) -> f64 {
    transactions
        .iter()
        .filter(|transaction| transaction.kind == kind)
        .map(|transaction| transaction.amount)
        .fold(0.0, |total, amount| total + amount)
}

/// Holds the latest snapshots for one identity and the aggregates derived
/// from them. Each update recomputes only the aggregates of its own kind, and
/// always from the full snapshot.
#[derive(Debug, Clone)]
pub struct AggregateEngine {
    identity: Identity,
    snapshots: SnapshotSet,
    result: AggregateResult,
}

impl AggregateEngine {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            snapshots: SnapshotSet::default(),
            result: AggregateResult::default(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn result(&self) -> &AggregateResult {
        &self.result
    }

    pub fn snapshots(&self) -> &SnapshotSet {
        &self.snapshots
    }

    pub fn reset(&mut self, identity: Identity) {
        *self = Self::new(identity);
    }

    /// Adopts `update` unless it belongs to another identity or is older than
    /// the snapshot already held for its kind. A snapshot from a newer
    /// subscription is always adopted, whatever its revision. Returns whether
    /// it was adopted.
    pub fn apply(&mut self, update: SnapshotUpdate) -> bool {
        if update.owner() != &self.identity {
            tracing::warn!(
                expected = %self.identity,
                received = %update.owner(),
                kind = update.kind().as_str(),
                "dropping snapshot from another identity"
            );
            return false;
        }

        let held = match &update {
            SnapshotUpdate::Tasks(_) => self.snapshots.tasks.as_ref().map(position),
            SnapshotUpdate::Projects(_) => self.snapshots.projects.as_ref().map(position),
            SnapshotUpdate::Transactions(_) => self.snapshots.transactions.as_ref().map(position),
            SnapshotUpdate::Notes(_) => self.snapshots.notes.as_ref().map(position),
        };
        if held.is_some_and(|held| held > (update.subscription(), update.revision())) {
            tracing::debug!(
                kind = update.kind().as_str(),
                subscription = update.subscription(),
                revision = update.revision(),
                "dropping stale snapshot"
            );
            return false;
        }

        match update {
            SnapshotUpdate::Tasks(snapshot) => {
                self.result.tasks = task_stats(snapshot.records());
                self.snapshots.tasks = Some(snapshot);
            }
            SnapshotUpdate::Projects(snapshot) => {
                self.result.projects = project_stats(snapshot.records());
                self.snapshots.projects = Some(snapshot);
            }
            SnapshotUpdate::Transactions(snapshot) => {
                self.result.finances = finance_stats(snapshot.records());
                self.snapshots.transactions = Some(snapshot);
            }
            SnapshotUpdate::Notes(snapshot) => {
                self.result.notes = note_stats(snapshot.records());
                self.snapshots.notes = Some(snapshot);
            }
        }
        true
    }
}
