use crate::db::{DocumentStore, SqliteDocumentStore};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, CollectionPath, CreateProjectPayload, CreateTaskPayload, CreateTransactionPayload, Identity,
    ProjectStatus, RecordKind, SaveNotePayload, TaskStatus, Task, Transaction,
};
use crate::suggestion::{finance_analysis_prompt, focus_suggestion_prompt, SuggestionClient};
use crate::sync::SyncAdapter;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Monotonic counter bumped whenever the signed-in scope is torn down.
#[derive(Debug, Clone, Default)]
pub struct ScopeGeneration(Arc<AtomicU64>);

impl ScopeGeneration {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ticket(&self) -> ScopeTicket {
        ScopeTicket {
            source: self.0.clone(),
            captured: self.current(),
        }
    }
}

/// Captured scope. Async work compares it on completion and drops its result
/// when the scope has moved on.
#[derive(Debug, Clone)]
pub struct ScopeTicket {
    source: Arc<AtomicU64>,
    captured: u64,
}

impl ScopeTicket {
    pub fn generation(&self) -> u64 {
        self.captured
    }

    pub fn is_current(&self) -> bool {
        self.source.load(Ordering::SeqCst) == self.captured
    }
}

/// Everything a screen needs: the store, settings, live sync, the suggestion
/// client, and the signed-in identity. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    store: Arc<dyn DocumentStore>,
    settings: AppSettings,
    sync: SyncAdapter,
    suggestions: SuggestionClient,
    identity: Arc<RwLock<Option<Identity>>>,
    generation: ScopeGeneration,
    data_dir: Option<PathBuf>,
}

impl AppContext {
    /// Opens (or creates) the embedded store under `data_dir` and loads its
    /// persisted settings.
    pub fn open(data_dir: PathBuf) -> AppResult<Self> {
        let db_path = data_dir.join("state.sqlite");
        let store = SqliteDocumentStore::new(&db_path)?;
        let settings = store.get_settings()?;
        let mut context = Self::with_store(Arc::new(store), settings)?;
        context.data_dir = Some(data_dir);
        Ok(context)
    }

    pub fn with_store(store: Arc<dyn DocumentStore>, settings: AppSettings) -> AppResult<Self> {
        let suggestions = SuggestionClient::from_settings(&settings)?;
        let sync = SyncAdapter::new(store.clone(), settings.app_id.clone());
        Ok(Self {
            store,
            settings,
            sync,
            suggestions,
            identity: Arc::new(RwLock::new(None)),
            generation: ScopeGeneration::default(),
            data_dir: None,
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn sync(&self) -> &SyncAdapter {
        &self.sync
    }

    pub fn suggestions(&self) -> &SuggestionClient {
        &self.suggestions
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn identity(&self) -> Option<Identity> {
        match self.identity.read() {
            Ok(identity) => identity.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn scope_ticket(&self) -> ScopeTicket {
        self.generation.ticket()
    }

    /// Switches to `identity`. Every live subscription of the previous scope
    /// is cancelled and outstanding tickets go stale before the switch.
    ///
    /// The identity lock is held across the whole switch, so work running in
    /// [`AppContext::with_scope`] finishes before the scope is torn down.
    pub fn sign_in(&self, identity: Identity) -> AppResult<()> {
        let mut current = self
            .identity
            .write()
            .map_err(|_| AppError::Internal("identity lock poisoned".to_string()))?;
        self.end_scope();
        tracing::info!(identity = %identity, "signed in");
        *current = Some(identity);
        Ok(())
    }

    pub fn sign_out(&self) -> AppResult<()> {
        let mut current = self
            .identity
            .write()
            .map_err(|_| AppError::Internal("identity lock poisoned".to_string()))?;
        self.end_scope();
        if let Some(previous) = current.take() {
            tracing::info!(identity = %previous, "signed out");
        }
        Ok(())
    }

    fn end_scope(&self) {
        self.sync.cancel_all();
        let generation = self.generation.advance();
        tracing::debug!(generation, "scope advanced");
    }

    pub fn require_identity(&self) -> AppResult<Identity> {
        self.identity()
            .ok_or_else(|| AppError::Unauthenticated("sign in before changing data".to_string()))
    }

    /// Runs `work` with the signed-in identity and a ticket taken from the
    /// same scope. A concurrent sign-in or sign-out waits until `work`
    /// returns, then tears down whatever it subscribed.
    ///
    /// `work` must not call back into identity methods of this context.
    pub fn with_scope<T>(&self, work: impl FnOnce(&Identity, ScopeTicket) -> AppResult<T>) -> AppResult<T> {
        let current = self
            .identity
            .read()
            .map_err(|_| AppError::Internal("identity lock poisoned".to_string()))?;
        let identity = current
            .as_ref()
            .ok_or_else(|| AppError::Unauthenticated("sign in first".to_string()))?;
        work(identity, self.generation.ticket())
    }

    fn path(&self, identity: &Identity, kind: RecordKind) -> CollectionPath {
        CollectionPath::new(&self.settings.app_id, identity, kind)
    }

    pub fn create_task(&self, payload: CreateTaskPayload) -> AppResult<String> {
        let identity = self.require_identity()?;
        let title = required_text(&payload.title, "task title")?;
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!(title));
        fields.insert("status".to_string(), json!(TaskStatus::Todo.as_str()));
        fields.insert("priority".to_string(), json!(payload.priority.map(|p| p.as_str())));
        fields.insert(
            "deadline".to_string(),
            json!(payload.deadline.map(|date| date.format("%Y-%m-%d").to_string())),
        );
        fields.insert("projectId".to_string(), json!(payload.project_id));
        fields.insert("completedAt".to_string(), Value::Null);
        self.write_create(&identity, RecordKind::Task, fields)
    }

    /// Moving a task to done stamps `completedAt`; any other status clears it.
    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> AppResult<()> {
        let identity = self.require_identity()?;
        let completed_at = if status.is_done() { json!(now_rfc3339()) } else { Value::Null };
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status.as_str()));
        fields.insert("completedAt".to_string(), completed_at);
        self.write_update(&identity, RecordKind::Task, task_id, fields)
    }

    pub fn delete_task(&self, task_id: &str) -> AppResult<()> {
        let identity = self.require_identity()?;
        self.write_delete(&identity, RecordKind::Task, task_id)
    }

    pub fn create_project(&self, payload: CreateProjectPayload) -> AppResult<String> {
        let identity = self.require_identity()?;
        let name = required_text(&payload.name, "project name")?;
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!(name));
        fields.insert(
            "description".to_string(),
            json!(payload.description.as_deref().map(str::trim).unwrap_or_default()),
        );
        fields.insert("status".to_string(), json!(ProjectStatus::Active.as_str()));
        fields.insert(
            "deadline".to_string(),
            json!(payload.deadline.map(|date| date.format("%Y-%m-%d").to_string())),
        );
        self.write_create(&identity, RecordKind::Project, fields)
    }

    pub fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> AppResult<()> {
        let identity = self.require_identity()?;
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status.as_str()));
        self.write_update(&identity, RecordKind::Project, project_id, fields)
    }

    pub fn create_transaction(&self, payload: CreateTransactionPayload) -> AppResult<String> {
        let identity = self.require_identity()?;
        let description = required_text(&payload.description, "transaction description")?;
        if !payload.amount.is_finite() || payload.amount <= 0.0 {
            return Err(AppError::Validation("transaction amount must be greater than zero".to_string()));
        }
        let date = payload.date.unwrap_or_else(Utc::now);
        let mut fields = Map::new();
        fields.insert("description".to_string(), json!(description));
        fields.insert("amount".to_string(), json!(payload.amount));
        fields.insert("type".to_string(), json!(payload.kind.as_str()));
        fields.insert(
            "category".to_string(),
            json!(payload.category.as_deref().map(str::trim).unwrap_or_default()),
        );
        fields.insert("date".to_string(), json!(date.to_rfc3339_opts(SecondsFormat::Millis, true)));
        self.write_create(&identity, RecordKind::Transaction, fields)
    }

    pub fn create_note(&self, payload: SaveNotePayload) -> AppResult<String> {
        let identity = self.require_identity()?;
        let fields = note_fields(&payload)?;
        self.write_create(&identity, RecordKind::Note, fields)
    }

    /// Rewrites the editable fields of a note. `createdAt` is left as stored.
    pub fn update_note(&self, note_id: &str, payload: SaveNotePayload) -> AppResult<()> {
        let identity = self.require_identity()?;
        let fields = note_fields(&payload)?;
        self.write_update(&identity, RecordKind::Note, note_id, fields)
    }

    pub fn delete_note(&self, note_id: &str) -> AppResult<()> {
        let identity = self.require_identity()?;
        self.write_delete(&identity, RecordKind::Note, note_id)
    }

    /// One-sentence pick of what to focus on next, from a fresh read of the
    /// task list. `None` when the scope changed while waiting.
    pub async fn focus_suggestion(&self) -> AppResult<Option<String>> {
        let (ticket, tasks) = self.with_scope(|identity, ticket| Ok((ticket, self.sync.fetch::<Task>(identity)?)))?;
        Ok(self
            .suggestions
            .answer_scoped(&ticket, focus_suggestion_prompt(tasks.records()))
            .await)
    }

    pub async fn finance_analysis(&self) -> AppResult<Option<String>> {
        let (ticket, transactions) =
            self.with_scope(|identity, ticket| Ok((ticket, self.sync.fetch::<Transaction>(identity)?)))?;
        Ok(self
            .suggestions
            .answer_scoped(&ticket, finance_analysis_prompt(transactions.records()))
            .await)
    }

    fn write_create(&self, identity: &Identity, kind: RecordKind, fields: Map<String, Value>) -> AppResult<String> {
        let id = self
            .store
            .create(&self.path(identity, kind), identity, fields)
            .inspect_err(|error| {
                tracing::warn!(identity = %identity, kind = kind.as_str(), error = %error, "create failed");
            })?;
        tracing::debug!(identity = %identity, kind = kind.as_str(), id = %id, "record created");
        Ok(id)
    }

    fn write_update(&self, identity: &Identity, kind: RecordKind, id: &str, fields: Map<String, Value>) -> AppResult<()> {
        self.store
            .update(&self.path(identity, kind), identity, id, fields)
            .inspect_err(|error| {
                tracing::warn!(identity = %identity, kind = kind.as_str(), id, error = %error, "update failed");
            })
    }

    fn write_delete(&self, identity: &Identity, kind: RecordKind, id: &str) -> AppResult<()> {
        self.store
            .delete(&self.path(identity, kind), identity, id)
            .inspect_err(|error| {
                tracing::warn!(identity = %identity, kind = kind.as_str(), id, error = %error, "delete failed");
            })
    }
}

fn note_fields(payload: &SaveNotePayload) -> AppResult<Map<String, Value>> {
    let title = required_text(&payload.title, "note title")?;
    let mut fields = Map::new();
    fields.insert("title".to_string(), json!(title));
    fields.insert("content".to_string(), json!(payload.content.trim()));
    fields.insert("category".to_string(), json!(payload.category.as_str()));
    fields.insert("tags".to_string(), json!(parse_tag_list(&payload.tags)));
    fields.insert("projectId".to_string(), json!(payload.project_id));
    fields.insert("updatedAt".to_string(), json!(now_rfc3339()));
    Ok(fields)
}

/// Splits the comma separated tag input, dropping blanks.
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn required_text<'a>(raw: &'a str, what: &str) -> AppResult<&'a str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{what} cannot be empty")));
    }
    Ok(trimmed)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::{parse_tag_list, AppContext};
    use crate::errors::AppError;
    use crate::models::{
        CreateProjectPayload, CreateTaskPayload, CreateTransactionPayload, Identity, Note, NoteCategory, Priority,
        Project, ProjectStatus, SaveNotePayload, Task, TaskStatus, Transaction, TransactionType,
    };
    use chrono::NaiveDate;

    fn open(dir: &tempfile::TempDir) -> AppContext {
        AppContext::open(dir.path().to_path_buf()).expect("context")
    }

    fn signed_in(dir: &tempfile::TempDir, user: &str) -> AppContext {
        let context = open(dir);
        context.sign_in(Identity::new(user).expect("identity")).expect("sign in");
        context
    }

    fn task_payload(title: &str) -> CreateTaskPayload {
        CreateTaskPayload {
            title: title.to_string(),
            deadline: NaiveDate::from_ymd_opt(2025, 6, 1),
            priority: Some(Priority::Medium),
            project_id: None,
        }
    }

    fn note_payload(title: &str, tags: &str) -> SaveNotePayload {
        SaveNotePayload {
            title: title.to_string(),
            content: "  body  ".to_string(),
            category: NoteCategory::Study,
            tags: tags.to_string(),
            project_id: None,
        }
    }

    #[test]
    fn writes_require_a_signed_in_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = open(&dir);
        assert!(matches!(
            context.create_task(task_payload("x")),
            Err(AppError::Unauthenticated(_))
        ));
        assert!(matches!(context.delete_note("n1"), Err(AppError::Unauthenticated(_))));
    }

    #[test]
    fn task_status_controls_completion_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let identity = context.require_identity().expect("identity");
        let id = context.create_task(task_payload("  Lab report  ")).expect("create");

        let created = context.sync().fetch::<Task>(&identity).expect("fetch");
        assert_eq!(created.records()[0].title, "Lab report");
        assert_eq!(created.records()[0].status, TaskStatus::Todo);
        assert_eq!(created.records()[0].deadline, NaiveDate::from_ymd_opt(2025, 6, 1));
        assert!(created.records()[0].completed_at.is_none());

        context.set_task_status(&id, TaskStatus::Done).expect("done");
        let done = context.sync().fetch::<Task>(&identity).expect("fetch");
        assert!(done.records()[0].status.is_done());
        assert!(done.records()[0].completed_at.is_some());

        context.set_task_status(&id, TaskStatus::InProgress).expect("reopen");
        let reopened = context.sync().fetch::<Task>(&identity).expect("fetch");
        assert!(reopened.records()[0].completed_at.is_none());

        context.delete_task(&id).expect("delete");
        assert!(context.sync().fetch::<Task>(&identity).expect("fetch").is_empty());
    }

    #[test]
    fn transactions_are_validated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let payload = |description: &str, amount: f64| CreateTransactionPayload {
            description: description.to_string(),
            amount,
            kind: TransactionType::Expense,
            category: None,
            date: None,
        };

        assert!(matches!(context.create_transaction(payload("  ", 10.0)), Err(AppError::Validation(_))));
        assert!(matches!(context.create_transaction(payload("Lunch", 0.0)), Err(AppError::Validation(_))));
        assert!(matches!(context.create_transaction(payload("Lunch", -5.0)), Err(AppError::Validation(_))));
        assert!(matches!(context.create_transaction(payload("Lunch", f64::NAN)), Err(AppError::Validation(_))));

        context.create_transaction(payload("Lunch", 25.5)).expect("create");
        let identity = context.require_identity().expect("identity");
        let stored = context.sync().fetch::<Transaction>(&identity).expect("fetch");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.records()[0].amount, 25.5);
        assert!(stored.records()[0].date.is_some());
    }

    #[test]
    fn projects_can_be_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let id = context
            .create_project(CreateProjectPayload {
                name: "Thesis".to_string(),
                description: None,
                deadline: None,
            })
            .expect("create");
        context.set_project_status(&id, ProjectStatus::Done).expect("close");

        let identity = context.require_identity().expect("identity");
        let projects = context.sync().fetch::<Project>(&identity).expect("fetch");
        assert!(projects.records()[0].status.is_done());
        assert!(projects.records()[0].description.is_empty());
    }

    #[test]
    fn note_edits_keep_creation_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let identity = context.require_identity().expect("identity");
        let id = context
            .create_note(note_payload("Calculus", "math, exam , ,"))
            .expect("create");

        let first = context.sync().fetch::<Note>(&identity).expect("fetch");
        let original = first.records()[0].clone();
        assert_eq!(original.tags, vec!["math".to_string(), "exam".to_string()]);
        assert_eq!(original.content, "body");
        assert!(original.created_at.is_some());

        context
            .update_note(&id, note_payload("Calculus II", "math"))
            .expect("update");
        let second = context.sync().fetch::<Note>(&identity).expect("fetch");
        let edited = &second.records()[0];
        assert_eq!(edited.title, "Calculus II");
        assert_eq!(edited.created_at, original.created_at);
        assert!(edited.updated_at >= original.updated_at);
        assert!(matches!(
            context.update_note("missing", note_payload("x", "")),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn switching_identity_isolates_data_and_invalidates_tickets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        context.create_task(task_payload("private")).expect("create");
        let ticket = context.scope_ticket();
        assert!(ticket.is_current());

        let other = Identity::new("u2").expect("identity");
        context.sign_in(other.clone()).expect("switch");
        assert!(!ticket.is_current());
        assert!(context.sync().fetch::<Task>(&other).expect("fetch").is_empty());

        context.sign_out().expect("sign out");
        assert!(context.identity().is_none());
    }

    #[tokio::test]
    async fn sign_in_tears_down_live_subscriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let identity = context.require_identity().expect("identity");
        let subscription = context.sync().subscribe::<Task>(&identity).expect("subscribe");

        context.sign_in(Identity::new("u2").expect("identity")).expect("switch");
        assert!(subscription.is_cancelled());
        assert_eq!(context.sync().active_count(), 0);
    }

    #[tokio::test]
    async fn identity_switch_waits_for_scoped_work_and_then_cancels_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");

        let (subscription, ticket, switch) = context
            .with_scope(|identity, ticket| {
                assert_eq!(identity.as_str(), "u1");
                assert!(ticket.is_current());
                let switcher = context.clone();
                let switch = std::thread::spawn(move || switcher.sign_in(Identity::new("u2").expect("identity")));
                // The switch is blocked on the identity lock while this scope runs.
                std::thread::sleep(std::time::Duration::from_millis(50));
                assert!(ticket.is_current());
                let subscription = context.sync().subscribe::<Task>(identity)?;
                Ok((subscription, ticket, switch))
            })
            .expect("scoped work");

        switch.join().expect("switch thread").expect("switch");
        assert!(subscription.is_cancelled());
        assert!(!ticket.is_current());
        assert_eq!(context.sync().active_count(), 0);
        assert_eq!(context.identity().expect("identity").as_str(), "u2");

        context.sign_out().expect("sign out");
        assert!(matches!(
            context.with_scope(|_, _| Ok(())),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn suggestions_short_circuit_without_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir, "u1");
        let focus = context.focus_suggestion().await.expect("focus");
        assert_eq!(focus.as_deref(), Some(crate::suggestion::NO_ACTIVE_TASKS));
        let finance = context.finance_analysis().await.expect("finance");
        assert_eq!(finance.as_deref(), Some(crate::suggestion::NO_EXPENSES));
    }

    #[test]
    fn tag_input_is_split_and_trimmed() {
        assert_eq!(parse_tag_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_tag_list("").is_empty());
    }
}
