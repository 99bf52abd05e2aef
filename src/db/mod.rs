use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, CollectionPath, Identity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Raw stored document: server metadata plus the loosely typed field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Emitted after every committed write to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub path: CollectionPath,
}

/// Collection-oriented store with owner-filtered queries and change notices.
pub trait DocumentStore: Send + Sync {
    fn query(&self, path: &CollectionPath, owner: &Identity) -> AppResult<Vec<Document>>;

    fn changes(&self) -> broadcast::Receiver<ChangeNotice>;

    /// Inserts a document and returns its server-assigned id. A `createdAt`
    /// timestamp is stamped unless the caller supplied one.
    fn create(&self, path: &CollectionPath, owner: &Identity, fields: Map<String, Value>) -> AppResult<String>;

    /// Shallow merge of `fields` into the stored document.
    fn update(&self, path: &CollectionPath, owner: &Identity, id: &str, fields: Map<String, Value>) -> AppResult<()>;

    fn delete(&self, path: &CollectionPath, owner: &Identity, id: &str) -> AppResult<()>;
}

#[derive(Debug)]
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    notifier: broadcast::Sender<ChangeNotice>,
}

impl SqliteDocumentStore {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::with_change_capacity(path, CHANGE_CHANNEL_CAPACITY)
    }

    /// Opens the store with a bounded change channel of `capacity` notices.
    /// Receivers that fall further behind observe a lag and must re-query.
    pub fn with_change_capacity(path: &Path, capacity: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        let (notifier, _) = broadcast::channel(capacity.max(1));

        let store = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            notifier,
        };

        store.ensure_default_settings()?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => match serde_json::from_str::<AppSettings>(&raw) {
                Ok(settings) => Ok(settings),
                Err(error) => {
                    tracing::warn!(error = %error, "stored settings are unreadable, using defaults");
                    Ok(AppSettings::default())
                }
            },
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid settings: {}", error)))?;

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    fn notify(&self, path: &CollectionPath) {
        // No receivers simply means nobody is subscribed yet.
        let _ = self.notifier.send(ChangeNotice { path: path.clone() });
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn query(&self, path: &CollectionPath, owner: &Identity) -> AppResult<Vec<Document>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, fields_json, created_at, updated_at
             FROM documents
             WHERE collection = ?1 AND owner_id = ?2
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![path.as_str(), owner.as_str()], parse_document_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    fn changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notifier.subscribe()
    }

    fn create(&self, path: &CollectionPath, owner: &Identity, mut fields: Map<String, Value>) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        fields
            .entry("createdAt")
            .or_insert_with(|| Value::String(now.to_rfc3339()));

        {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute(
                "INSERT INTO documents (id, collection, owner_id, fields_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    id,
                    path.as_str(),
                    owner.as_str(),
                    serde_json::to_string(&fields)?,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|error| AppError::Write(error.to_string()))?;
        }

        self.notify(path);
        Ok(id)
    }

    fn update(&self, path: &CollectionPath, owner: &Identity, id: &str, fields: Map<String, Value>) -> AppResult<()> {
        {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            let existing = conn
                .query_row(
                    "SELECT fields_json FROM documents WHERE id = ?1 AND collection = ?2 AND owner_id = ?3",
                    params![id, path.as_str(), owner.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            let Some(existing) = existing else {
                return Err(AppError::NotFound(format!("document {} not found in {}", id, path)));
            };

            let mut merged: Map<String, Value> = serde_json::from_str(&existing).unwrap_or_default();
            for (key, value) in fields {
                merged.insert(key, value);
            }

            conn.execute(
                "UPDATE documents SET fields_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&merged)?, Utc::now().to_rfc3339(), id],
            )
            .map_err(|error| AppError::Write(error.to_string()))?;
        }

        self.notify(path);
        Ok(())
    }

    fn delete(&self, path: &CollectionPath, owner: &Identity, id: &str) -> AppResult<()> {
        let affected = {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute(
                "DELETE FROM documents WHERE id = ?1 AND collection = ?2 AND owner_id = ?3",
                params![id, path.as_str(), owner.as_str()],
            )
            .map_err(|error| AppError::Write(error.to_string()))?
        };
        if affected == 0 {
            return Err(AppError::NotFound(format!("document {} not found in {}", id, path)));
        }

        self.notify(path);
        Ok(())
    }
}

fn parse_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let fields_raw: String = row.get(2)?;
    let fields = match serde_json::from_str::<Value>(&fields_raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    Ok(Document {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        fields,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        updated_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DocumentStore, SqliteDocumentStore};
    use crate::errors::AppError;
    use crate::models::{CollectionPath, Identity, RecordKind};
    use serde_json::{json, Map, Value};

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn query_only_returns_documents_owned_by_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        let alice = Identity::new("alice").expect("identity");
        let bob = Identity::new("bob").expect("identity");
        let alice_tasks = CollectionPath::new("app", &alice, RecordKind::Task);
        let bob_tasks = CollectionPath::new("app", &bob, RecordKind::Task);

        store
            .create(&alice_tasks, &alice, fields(json!({ "title": "essay" })))
            .expect("create alice");
        store
            .create(&bob_tasks, &bob, fields(json!({ "title": "lab" })))
            .expect("create bob");
        // Same path, foreign owner: the owner predicate still filters it out.
        store
            .create(&alice_tasks, &bob, fields(json!({ "title": "intruder" })))
            .expect("create foreign");

        let docs = store.query(&alice_tasks, &alice).expect("query");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].owner_id, "alice");
        assert_eq!(docs[0].fields.get("title"), Some(&json!("essay")));
        assert!(docs[0].fields.contains_key("createdAt"));
    }

    #[test]
    fn update_merges_fields_and_delete_removes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        let owner = Identity::new("u1").expect("identity");
        let path = CollectionPath::new("app", &owner, RecordKind::Task);

        let id = store
            .create(&path, &owner, fields(json!({ "title": "read", "status": "todo" })))
            .expect("create");
        store
            .update(&path, &owner, &id, fields(json!({ "status": "done" })))
            .expect("update");

        let docs = store.query(&path, &owner).expect("query");
        assert_eq!(docs[0].fields.get("title"), Some(&json!("read")));
        assert_eq!(docs[0].fields.get("status"), Some(&json!("done")));

        store.delete(&path, &owner, &id).expect("delete");
        assert!(store.query(&path, &owner).expect("query").is_empty());
        assert!(matches!(store.delete(&path, &owner, &id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn update_of_foreign_document_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        let owner = Identity::new("u1").expect("identity");
        let other = Identity::new("u2").expect("identity");
        let path = CollectionPath::new("app", &owner, RecordKind::Note);

        let id = store
            .create(&path, &owner, fields(json!({ "title": "mine" })))
            .expect("create");
        let result = store.update(&path, &other, &id, fields(json!({ "title": "stolen" })));
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn writes_emit_change_notices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        let owner = Identity::new("u1").expect("identity");
        let path = CollectionPath::new("app", &owner, RecordKind::Project);
        let mut changes = store.changes();

        store
            .create(&path, &owner, fields(json!({ "name": "thesis" })))
            .expect("create");

        let notice = changes.try_recv().expect("notice");
        assert_eq!(notice.path, path);
    }

    #[test]
    fn settings_are_seeded_and_merged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");

        let defaults = store.get_settings().expect("settings");
        assert_eq!(defaults.recent_tasks_limit, 5);

        let updated = store
            .update_settings(json!({ "recentTasksLimit": 8, "suggestionApiKey": "k" }))
            .expect("update settings");
        assert_eq!(updated.recent_tasks_limit, 8);
        assert_eq!(updated.suggestion_api_key.as_deref(), Some("k"));
        assert_eq!(store.get_settings().expect("settings").recent_tasks_limit, 8);

        let rejected = store.update_settings(json!({ "recentTasksLimit": "many" }));
        assert!(matches!(rejected, Err(AppError::Validation(_))));
    }

    #[test]
    fn unreadable_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDocumentStore::new(&dir.path().join("test.db")).expect("store");
        {
            let conn = store.conn.lock().expect("conn");
            conn.execute("UPDATE settings SET value_json = 'not json' WHERE key = 'app'", [])
                .expect("corrupt settings");
        }

        let settings = store.get_settings().expect("settings");
        assert_eq!(settings.recent_tasks_limit, 5);
        assert_eq!(settings.app_id, "study-desk");

        let repaired = store
            .update_settings(json!({ "activeProjectsLimit": 4 }))
            .expect("update settings");
        assert_eq!(repaired.active_projects_limit, 4);
        assert_eq!(store.get_settings().expect("settings").active_projects_limit, 4);
    }
}
