use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::{
    Connection, params, params_from_iter,
    types::{Value, ValueRef},
};
use tokio::{sync::oneshot, task};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("expected one row but found none")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub trait ToSql: Send + Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSql for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }
}

impl ToSql for u32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSql for str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.to_string())
    }
}

impl<T> ToSql for &T
where
    T: ToSql + ?Sized,
{
    fn to_sql_value(&self) -> SqlValue {
        (**self).to_sql_value()
    }
}

impl<T> ToSql for Option<T>
where
    T: ToSql,
{
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(value) => value.to_sql_value(),
            None => SqlValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        match self.values.get(index) {
            Some(SqlValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn integer(&self, index: usize) -> Option<i64> {
        match self.values.get(index) {
            Some(SqlValue::Integer(integer)) => Some(*integer),
            _ => None,
        }
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

#[allow(async_fn_in_trait)]
pub trait Database: Send + Sync + 'static {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError>;

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError>;

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError>;
}

/// SQLite on disk. Writes are serialized through one writer thread; reads
/// open a short-lived connection on the blocking pool.
#[derive(Debug)]
pub struct NativeDatabase {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

#[derive(Debug)]
struct WriteCommand {
    sql: String,
    params: Vec<SqlValue>,
    response: oneshot::Sender<Result<u64, StorageError>>,
}

fn collect_params(params: &[&dyn ToSql]) -> Vec<SqlValue> {
    params.iter().map(|param| param.to_sql_value()).collect()
}

fn to_rusqlite_values(values: &[SqlValue]) -> Vec<Value> {
    values
        .iter()
        .map(|value| match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(integer) => Value::Integer(*integer),
            SqlValue::Real(real) => Value::Real(*real),
            SqlValue::Text(text) => Value::Text(text.clone()),
            SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
        })
        .collect()
}

fn from_value_ref(value_ref: ValueRef<'_>) -> SqlValue {
    match value_ref {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(integer) => SqlValue::Integer(integer),
        ValueRef::Real(real) => SqlValue::Real(real),
        ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn connection_failed(path: &Path, error: impl std::fmt::Display) -> StorageError {
    StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| connection_failed(path, error))?;
    }

    let connection = Connection::open(path).map_err(|error| connection_failed(path, error))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| connection_failed(path, error))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| connection_failed(path, error))?;

    Ok(connection)
}

fn execute_statement(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StorageError> {
    let values = to_rusqlite_values(params);

    connection
        .execute(sql, params_from_iter(values.iter()))
        .map(|rows_affected| rows_affected as u64)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let values = to_rusqlite_values(params);
    let column_count = statement.column_count();
    let mut rows = statement
        .query(params_from_iter(values.iter()))
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let mut output = Vec::new();

    while let Some(row) = rows
        .next()
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?
    {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row
                .get_ref(index)
                .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
            values.push(from_value_ref(value));
        }
        output.push(Row::new(values));
    }

    Ok(output)
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_versioned_records.sql"),
}];

fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        let migration_failed = |stage: &str, error: rusqlite::Error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("{stage}: {error}"),
        };

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| migration_failed("failed to begin transaction", error))?;
        tx.execute_batch(migration.sql)
            .map_err(|error| migration_failed("failed to apply", error))?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| migration_failed("failed to record migration", error))?;
        tx.commit()
            .map_err(|error| migration_failed("failed to commit migration", error))?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let connection = open_connection(&path).map_err(|error| error.to_string());

    while let Ok(command) = receiver.recv() {
        let result = match &connection {
            Ok(connection) => execute_statement(connection, &command.sql, &command.params),
            Err(reason) => Err(StorageError::ConnectionFailed {
                path: path.clone(),
                reason: reason.clone(),
            }),
        };

        let _ = command.response.send(result);
    }

    debug!(path = %path.display(), "storage writer stopped");
}

impl NativeDatabase {
    /// Open (creating if needed) the database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_connection(&setup_path)?;
            run_migrations(&connection)
        })
        .await
        .map_err(|error| connection_failed(&path, format!("setup task failed: {error}")))??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("storage_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| {
                connection_failed(&path, format!("failed to spawn storage_writer: {error}"))
            })?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Database for NativeDatabase {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let (response, response_rx) = oneshot::channel();
        let command = WriteCommand {
            sql: sql.to_string(),
            params: collect_params(params),
            response,
        };

        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("storage writer is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed("storage writer terminated before responding".to_string())
        })?
    }

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let sql = sql.to_string();
        let params = collect_params(params);
        let path = self.path.clone();
        let rows = task::spawn_blocking(move || {
            let connection = open_connection(&path)?;
            query_rows(&connection, &sql, &params)
        })
        .await
        .map_err(|error| StorageError::QueryFailed(format!("failed to join query task: {error}")))??;

        rows.iter().map(T::from_row).collect()
    }

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError> {
        self.query(sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or(StorageError::NotFound)
    }
}

pub async fn open_database(path: &Path) -> Result<NativeDatabase, StorageError> {
    NativeDatabase::open(path).await
}
