pub mod aggregate;
pub mod context;
pub mod dashboard;
pub mod db;
pub mod errors;
pub mod models;
pub mod pomodoro;
pub mod projection;
pub mod suggestion;
pub mod sync;

pub use aggregate::{aggregate, AggregateEngine, AggregateResult, SnapshotSet, SnapshotUpdate};
pub use context::{AppContext, ScopeTicket};
pub use dashboard::{Dashboard, DashboardView};
pub use db::{DocumentStore, SqliteDocumentStore};
pub use errors::{AppError, AppResult};
pub use models::{AppSettings, Identity, RecordKind, Snapshot};
pub use suggestion::SuggestionClient;
pub use sync::{Subscription, SyncAdapter};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging into daily files under `data_dir/logs`. The level
/// comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "study-desk.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
