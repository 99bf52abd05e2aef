use crate::aggregate::{AggregateEngine, AggregateResult, SnapshotUpdate};
use crate::context::{AppContext, ScopeTicket};
use crate::errors::AppResult;
use crate::models::{AppSettings, Identity, Project, Snapshot, Task, Transaction};
use crate::projection::{active_projects, recent_pending, recent_transactions};
use crate::suggestion::weekly_report_prompt;
use crate::sync::{Record, Subscription, SubscriptionHandle};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub text: &'static str,
    pub author: &'static str,
}

pub const QUOTES: [Quote; 5] = [
    Quote {
        text: "Education is the most powerful weapon which you can use to change the world.",
        author: "Nelson Mandela",
    },
    Quote {
        text: "The only source of knowledge is experience.",
        author: "Albert Einstein",
    },
    Quote {
        text: "Success is the result of preparation, hard work, and learning from failure.",
        author: "Colin Powell",
    },
    Quote {
        text: "The future belongs to those who believe in the beauty of their dreams.",
        author: "Eleanor Roosevelt",
    },
    Quote {
        text: "Don't wait for the right opportunity: create it.",
        author: "George Bernard Shaw",
    },
];

pub fn pick_quote<R: Rng + ?Sized>(rng: &mut R) -> &'static Quote {
    &QUOTES[rng.random_range(0..QUOTES.len())]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardLimits {
    pub tasks: usize,
    pub projects: usize,
    pub transactions: usize,
}

impl DashboardLimits {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            tasks: settings.recent_tasks_limit,
            projects: settings.active_projects_limit,
            transactions: settings.recent_transactions_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub identity: Identity,
    pub stats: AggregateResult,
    pub recent_tasks: Vec<Task>,
    pub active_projects: Vec<Project>,
    pub recent_transactions: Vec<Transaction>,
}

impl DashboardView {
    fn build(engine: &AggregateEngine, limits: DashboardLimits) -> Self {
        let snapshots = engine.snapshots();
        Self {
            identity: engine.identity().clone(),
            stats: engine.result().clone(),
            recent_tasks: snapshots
                .tasks
                .as_ref()
                .map(|tasks| recent_pending(tasks, limits.tasks).cloned().collect())
                .unwrap_or_default(),
            active_projects: snapshots
                .projects
                .as_ref()
                .map(|projects| active_projects(projects, limits.projects).cloned().collect())
                .unwrap_or_default(),
            recent_transactions: snapshots
                .transactions
                .as_ref()
                .map(|transactions| recent_transactions(transactions, limits.transactions).cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Live dashboard for the signed-in identity. Owns the task, project and
/// transaction subscriptions and republishes a fresh view after each change.
pub struct Dashboard {
    view: watch::Receiver<DashboardView>,
    handles: Vec<Arc<SubscriptionHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    quote: &'static Quote,
}

impl Dashboard {
    /// Must be called from within a tokio runtime.
    ///
    /// A kind whose subscription cannot be set up is logged and shown empty.
    /// The other kinds stay live.
    pub fn start(context: &AppContext) -> AppResult<Self> {
        let limits = DashboardLimits::from_settings(context.settings());
        // An identity switch waits until all three kinds are subscribed.
        let (identity, engine, tasks, projects, transactions) = context.with_scope(|identity, _ticket| {
            let mut engine = AggregateEngine::new(identity.clone());
            let tasks = seed::<Task>(context, identity, &mut engine, SnapshotUpdate::Tasks);
            let projects = seed::<Project>(context, identity, &mut engine, SnapshotUpdate::Projects);
            let transactions = seed::<Transaction>(context, identity, &mut engine, SnapshotUpdate::Transactions);
            Ok((identity.clone(), engine, tasks, projects, transactions))
        })?;

        let handles = [
            tasks.as_ref().map(Subscription::handle),
            projects.as_ref().map(Subscription::handle),
            transactions.as_ref().map(Subscription::handle),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (sender, view) = watch::channel(DashboardView::build(&engine, limits));
        let task = tokio::spawn(pump(engine, limits, sender, tasks, projects, transactions));
        tracing::info!(identity = %identity, "dashboard started");

        Ok(Self {
            view,
            handles,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
            quote: pick_quote(&mut rand::rng()),
        })
    }

    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    pub fn quote(&self) -> &'static Quote {
        self.quote
    }

    /// True after `stop`, or once every subscription has closed and the view
    /// no longer changes.
    pub fn is_stopped(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return true;
        }
        match self.task.lock() {
            Ok(slot) => slot.as_ref().map_or(true, JoinHandle::is_finished),
            Err(_) => true,
        }
    }

    /// Cancels the live subscriptions. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in &self.handles {
            handle.cancel();
        }
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!("dashboard stopped");
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Subscribes one kind and applies its first snapshot to `engine`. When the
/// subscription cannot be set up the kind is seeded with an empty snapshot.
fn seed<R: Record>(
    context: &AppContext,
    identity: &Identity,
    engine: &mut AggregateEngine,
    wrap: fn(Snapshot<R>) -> SnapshotUpdate,
) -> Option<Subscription<R>> {
    match context.sync().subscribe::<R>(identity) {
        Ok(subscription) => {
            engine.apply(wrap(subscription.latest()));
            Some(subscription)
        }
        Err(error) => {
            tracing::warn!(
                identity = %identity,
                kind = R::KIND.as_str(),
                error = %error,
                "dashboard subscription failed, showing kind as empty"
            );
            engine.apply(wrap(Snapshot::empty(identity.clone())));
            None
        }
    }
}

/// Waits for the next snapshot in `slot`. A closed subscription is dropped
/// from the slot, so its kind keeps the last snapshot the engine adopted.
/// An empty slot never resolves.
async fn next_snapshot<R: Record>(slot: &mut Option<Subscription<R>>) -> Option<Snapshot<R>> {
    let Some(subscription) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let next = subscription.changed().await;
    if next.is_none() {
        tracing::warn!(kind = R::KIND.as_str(), "dashboard subscription closed, keeping last snapshot");
        *slot = None;
    }
    next
}

async fn pump(
    mut engine: AggregateEngine,
    limits: DashboardLimits,
    sender: watch::Sender<DashboardView>,
    mut tasks: Option<Subscription<Task>>,
    mut projects: Option<Subscription<Project>>,
    mut transactions: Option<Subscription<Transaction>>,
) {
    loop {
        if tasks.is_none() && projects.is_none() && transactions.is_none() {
            tracing::info!(identity = %engine.identity(), "every dashboard subscription closed");
            break;
        }
        let update = tokio::select! {
            next = next_snapshot(&mut tasks) => next.map(SnapshotUpdate::Tasks),
            next = next_snapshot(&mut projects) => next.map(SnapshotUpdate::Projects),
            next = next_snapshot(&mut transactions) => next.map(SnapshotUpdate::Transactions),
        };
        let Some(update) = update else {
            continue;
        };
        if engine.apply(update) && sender.send(DashboardView::build(&engine, limits)).is_err() {
            break;
        }
    }
}

/// Coaching report over the tasks completed in the last seven days, read
/// fresh from the store. `None` when `ticket` went stale while waiting.
pub async fn weekly_report(context: &AppContext, ticket: &ScopeTicket) -> AppResult<Option<String>> {
    let tasks = context.with_scope(|identity, _ticket| context.sync().fetch::<Task>(identity))?;
    let prompt = weekly_report_prompt(tasks.records(), Utc::now());
    Ok(context.suggestions().answer_scoped(ticket, prompt).await)
}

#[cfg(test)]
mod tests {
    use super::{pick_quote, weekly_report, Dashboard, DashboardView, QUOTES};
    use crate::context::AppContext;
    use crate::db::{ChangeNotice, Document, DocumentStore, SqliteDocumentStore};
    use crate::errors::{AppError, AppResult};
    use crate::models::{
        AppSettings, CollectionPath, CreateTaskPayload, CreateTransactionPayload, Identity, Priority, RecordKind, Task,
        TaskStatus, TransactionType,
    };
    use crate::suggestion::NO_COMPLETED_TASKS;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};

    /// SQLite underneath, but the transactions collection cannot be read.
    struct NoFinanceStore {
        inner: SqliteDocumentStore,
    }

    impl DocumentStore for NoFinanceStore {
        fn query(&self, path: &CollectionPath, owner: &Identity) -> AppResult<Vec<Document>> {
            if path.as_str().ends_with(RecordKind::Transaction.collection()) {
                return Err(AppError::Io("unreachable".to_string()));
            }
            self.inner.query(path, owner)
        }

        fn changes(&self) -> broadcast::Receiver<ChangeNotice> {
            self.inner.changes()
        }

        fn create(&self, path: &CollectionPath, owner: &Identity, fields: Map<String, Value>) -> AppResult<String> {
            self.inner.create(path, owner, fields)
        }

        fn update(
            &self,
            path: &CollectionPath,
            owner: &Identity,
            id: &str,
            fields: Map<String, Value>,
        ) -> AppResult<()> {
            self.inner.update(path, owner, id, fields)
        }

        fn delete(&self, path: &CollectionPath, owner: &Identity, id: &str) -> AppResult<()> {
            self.inner.delete(path, owner, id)
        }
    }

    fn income(amount: f64) -> CreateTransactionPayload {
        CreateTransactionPayload {
            description: "Tutoring".to_string(),
            amount,
            kind: TransactionType::Income,
            category: None,
            date: None,
        }
    }

    fn signed_in(dir: &tempfile::TempDir) -> AppContext {
        let context = AppContext::open(dir.path().to_path_buf()).expect("context");
        context.sign_in(Identity::new("u1").expect("identity")).expect("sign in");
        context
    }

    fn task(title: &str, priority: Priority) -> CreateTaskPayload {
        CreateTaskPayload {
            title: title.to_string(),
            deadline: None,
            priority: Some(priority),
            project_id: None,
        }
    }

    async fn wait_for(
        receiver: &mut watch::Receiver<DashboardView>,
        predicate: impl FnMut(&DashboardView) -> bool,
    ) -> DashboardView {
        let view = tokio::time::timeout(Duration::from_secs(3), receiver.wait_for(predicate))
            .await
            .expect("view in time")
            .expect("view channel open");
        view.clone()
    }

    #[tokio::test]
    async fn requires_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::open(dir.path().to_path_buf()).expect("context");
        assert!(matches!(Dashboard::start(&context), Err(AppError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn initial_view_reflects_stored_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        let done = context.create_task(task("done", Priority::Low)).expect("create");
        context.set_task_status(&done, TaskStatus::Done).expect("status");
        context.create_task(task("open", Priority::High)).expect("create");

        let dashboard = Dashboard::start(&context).expect("start");
        let view = dashboard.view();
        assert_eq!(view.stats.tasks.total, 2);
        assert_eq!(view.stats.tasks.productivity, 50);
        assert_eq!(view.recent_tasks.len(), 1);
        assert_eq!(view.recent_tasks[0].title, "open");
        assert!(QUOTES.contains(dashboard.quote()));
    }

    #[tokio::test]
    async fn writes_flow_into_the_published_view() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        let dashboard = Dashboard::start(&context).expect("start");
        let mut receiver = dashboard.watch();

        context
            .create_transaction(CreateTransactionPayload {
                description: "Scholarship".to_string(),
                amount: 100.0,
                kind: TransactionType::Income,
                category: None,
                date: None,
            })
            .expect("income");
        context
            .create_transaction(CreateTransactionPayload {
                description: "Books".to_string(),
                amount: 40.0,
                kind: TransactionType::Expense,
                category: Some("study".to_string()),
                date: None,
            })
            .expect("expense");

        let view = wait_for(&mut receiver, |view| view.stats.finances.expense > 0.0).await;
        assert_eq!(view.stats.finances.income, 100.0);
        assert_eq!(view.stats.finances.balance, 60.0);
        assert_eq!(view.recent_transactions.len(), 2);
        assert_eq!(view.stats.tasks.total, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_subscriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        let dashboard = Dashboard::start(&context).expect("start");
        assert_eq!(context.sync().active_count(), 3);

        dashboard.stop();
        dashboard.stop();
        assert!(dashboard.is_stopped());
        assert_eq!(context.sync().active_count(), 0);

        context.create_task(task("after stop", Priority::Medium)).expect("create");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dashboard.view().stats.tasks.total, 0);
    }

    #[tokio::test]
    async fn identity_switch_freezes_the_old_dashboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        let dashboard = Dashboard::start(&context).expect("start");

        context.sign_in(Identity::new("u2").expect("identity")).expect("switch");
        context.create_task(task("someone else", Priority::High)).expect("create");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let view = dashboard.view();
        assert_eq!(view.identity.as_str(), "u1");
        assert_eq!(view.stats.tasks.total, 0);
        assert!(dashboard.is_stopped());
    }

    #[tokio::test]
    async fn losing_one_subscription_keeps_the_other_kinds_live() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        let identity = context.require_identity().expect("identity");
        context.create_task(task("before", Priority::Low)).expect("create");
        let dashboard = Dashboard::start(&context).expect("start");
        let mut receiver = dashboard.watch();

        // Another screen takes over the task subscription for the same identity.
        let _tasks_screen = context.sync().subscribe::<Task>(&identity).expect("subscribe");
        context.create_transaction(income(100.0)).expect("income");

        let view = wait_for(&mut receiver, |view| view.stats.finances.income == 100.0).await;
        assert_eq!(view.stats.finances.balance, 100.0);
        assert_eq!(view.stats.tasks.total, 1);
        assert!(!dashboard.is_stopped());
        assert_eq!(context.sync().active_count(), 3);
    }

    #[tokio::test]
    async fn failed_kind_starts_empty_while_others_stay_live() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        let context = AppContext::with_store(Arc::new(NoFinanceStore { inner }), AppSettings::default()).expect("context");
        context.sign_in(Identity::new("u1").expect("identity")).expect("sign in");
        context.create_task(task("kept", Priority::High)).expect("create");

        let dashboard = Dashboard::start(&context).expect("start");
        let view = dashboard.view();
        assert_eq!(view.stats.tasks.total, 1);
        assert_eq!(view.stats.finances.income, 0.0);
        assert_eq!(view.stats.finances.balance, 0.0);
        assert!(view.recent_transactions.is_empty());
        assert_eq!(context.sync().active_count(), 2);

        let mut receiver = dashboard.watch();
        context.create_task(task("added", Priority::Low)).expect("create");
        let view = wait_for(&mut receiver, |view| view.stats.tasks.total == 2).await;
        assert_eq!(view.recent_tasks.len(), 2);

        dashboard.stop();
        assert_eq!(context.sync().active_count(), 0);
    }

    #[tokio::test]
    async fn weekly_report_without_completed_work_answers_locally() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = signed_in(&dir);
        context.create_task(task("open", Priority::Low)).expect("create");

        let ticket = context.scope_ticket();
        let report = weekly_report(&context, &ticket).await.expect("report");
        assert_eq!(report.as_deref(), Some(NO_COMPLETED_TASKS));

        context.sign_out().expect("sign out");
        assert!(matches!(
            weekly_report(&context, &ticket).await,
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn quotes_are_picked_from_the_fixed_list() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert!(QUOTES.contains(pick_quote(&mut rng)));
        }
    }
}
