//! SQLite-backed execution ledger.
#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use camino::Utf8Path;
use log::debug;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::{
    ExecutionId, ExecutionRequest, ExecutionStatus, ExecutionUpdate, LayerProgress, LayerRef,
    LayerState, LegacyStatus, LogEntry, NewExecution, unix_now,
};

use super::{COMPLETED_LOG, CREATED_LOG, ExecutionLedger, LedgerError, barrier_reached};

/// Supported version of the ledger tables.
const LEDGER_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Execution ledger persisted in SQLite.
///
/// A single connection guarded by a mutex serialises writers; every
/// operation runs inside its own `IMMEDIATE` transaction, so a second
/// connection on the same file waits on the busy timeout instead of failing
/// a lock upgrade.
///
/// # Examples
///
/// ```
/// use geoport_core::{
///     Action, ExecutionLedger, ExecutionSource, ExecutionStatus, InputParams, NewExecution,
///     SqliteExecutionLedger,
/// };
///
/// let ledger = SqliteExecutionLedger::open_in_memory().expect("open ledger");
/// let id = ledger
///     .create(NewExecution {
///         user: "alice".into(),
///         input_params: InputParams::default(),
///         action: Action::Import,
///         name: "roads".into(),
///         legacy_upload_name: "roads".into(),
///         source: ExecutionSource::Upload,
///         step: None,
///     })
///     .expect("create execution");
/// assert_eq!(ledger.get(id).expect("fetch").status, ExecutionStatus::Running);
/// ```
#[derive(Debug)]
pub struct SqliteExecutionLedger {
    connection: Mutex<Connection>,
}

impl SqliteExecutionLedger {
    /// Open (or create) a ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when the database cannot be opened or
    /// migrated.
    pub fn open(path: &Utf8Path) -> Result<Self, LedgerError> {
        let connection = Connection::open(path.as_std_path()).map_err(sqlite("open database"))?;
        Self::from_connection(connection)
    }

    /// Open a private in-memory ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let connection = Connection::open_in_memory().map_err(sqlite("open database"))?;
        Self::from_connection(connection)
    }

    fn from_connection(mut connection: Connection) -> Result<Self, LedgerError> {
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(sqlite("configure busy timeout"))?;
        connection
            .pragma_update(None, "foreign_keys", true)
            .map_err(sqlite("enable foreign keys"))?;
        initialise_schema(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.connection.lock().map_err(|_| LedgerError::Poisoned)
    }

    fn in_transaction<T>(
        &self,
        operation: &'static str,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut connection = self.lock()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sqlite(operation))?;
        let value = body(&transaction)?;
        transaction.commit().map_err(sqlite(operation))?;
        Ok(value)
    }
}

impl ExecutionLedger for SqliteExecutionLedger {
    fn create(&self, execution: NewExecution) -> Result<ExecutionId, LedgerError> {
        let id = ExecutionId::new_v4();
        let params_json =
            serde_json::to_string(&execution.input_params).map_err(|source| {
                LedgerError::Storage {
                    operation: "encode input params",
                    source: Box::new(source),
                }
            })?;
        self.in_transaction("create execution", |tx| {
            let now = sql_time(unix_now());
            tx.execute(
                "INSERT INTO geoport_executions (
                    exec_id, user, status, legacy_status, step, input_params, action,
                    name, legacy_upload_name, source, created, last_updated
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id.to_string(),
                    execution.user,
                    ExecutionStatus::Pending.as_str(),
                    LegacyStatus::Ready.as_str(),
                    execution.step,
                    params_json,
                    execution.action.as_str(),
                    execution.name,
                    execution.legacy_upload_name,
                    execution.source.as_str(),
                    now,
                ],
            )
            .map_err(sqlite("insert execution"))?;
            write_status(tx, id, ExecutionStatus::Running, LegacyStatus::Running)?;
            append_log(tx, id, CREATED_LOG)?;
            Ok(())
        })?;
        debug!("created execution {id}");
        Ok(id)
    }

    fn get(&self, id: ExecutionId) -> Result<ExecutionRequest, LedgerError> {
        let connection = self.lock()?;
        load_execution(&connection, id)
    }

    fn update(&self, id: ExecutionId, update: ExecutionUpdate) -> Result<(), LedgerError> {
        self.in_transaction("update execution", |tx| {
            let current = read_counters(tx, id)?;
            if current.status.is_terminal() {
                if let Some(message) = update.log.as_deref() {
                    append_log(tx, id, message)?;
                }
                return Ok(());
            }
            if let Some(next) = update.status {
                if !current.status.can_transition_to(next) {
                    return Err(LedgerError::InvalidTransition {
                        id,
                        from: current.status,
                        to: next,
                    });
                }
            }
            let legacy = update
                .legacy_status
                .or_else(|| update.status.map(LegacyStatus::for_status));
            tx.execute(
                "UPDATE geoport_executions SET
                    status = COALESCE(?2, status),
                    legacy_status = COALESCE(?3, legacy_status),
                    step = COALESCE(?4, step),
                    last_updated = ?5
                 WHERE exec_id = ?1",
                params![
                    id.to_string(),
                    update.status.map(ExecutionStatus::as_str),
                    legacy.map(LegacyStatus::as_str),
                    update.step,
                    sql_time(unix_now()),
                ],
            )
            .map_err(sqlite("update execution"))?;
            if let Some(message) = update.log.as_deref() {
                append_log(tx, id, message)?;
            }
            Ok(())
        })
    }

    fn set_failed(&self, id: ExecutionId, reason: &str) -> Result<bool, LedgerError> {
        self.in_transaction("fail execution", |tx| {
            let current = read_counters(tx, id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            write_status(tx, id, ExecutionStatus::Failed, LegacyStatus::Invalid)?;
            append_log(tx, id, reason)?;
            Ok(true)
        })
    }

    fn complete(&self, id: ExecutionId) -> Result<bool, LedgerError> {
        self.in_transaction("complete execution", |tx| {
            let current = read_counters(tx, id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            mark_completed(tx, id)?;
            Ok(true)
        })
    }

    fn record_layer_stage(
        &self,
        id: ExecutionId,
        layer: &LayerRef,
        stage: &str,
        state: LayerState,
    ) -> Result<bool, LedgerError> {
        self.in_transaction("record layer stage", |tx| {
            if read_counters(tx, id)?.status.is_terminal() {
                return Ok(false);
            }
            tx.prepare_cached(
                "INSERT INTO geoport_layer_progress (exec_id, layer, alternate, stage, state, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (exec_id, layer) DO UPDATE SET
                    alternate = excluded.alternate,
                    stage = excluded.stage,
                    state = excluded.state,
                    updated = excluded.updated",
            )
            .map_err(sqlite("prepare layer upsert"))?
            .execute(params![
                id.to_string(),
                layer.name,
                layer.alternate,
                stage,
                state.as_str(),
                sql_time(unix_now()),
            ])
            .map_err(sqlite("upsert layer progress"))?;
            Ok(true)
        })
    }

    fn layer_progress(&self, id: ExecutionId) -> Result<Vec<LayerProgress>, LedgerError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare_cached(
                "SELECT layer, alternate, stage, state FROM geoport_layer_progress
                 WHERE exec_id = ?1 ORDER BY layer",
            )
            .map_err(sqlite("prepare layer progress query"))?;
        let rows = statement
            .query_map([id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sqlite("query layer progress"))?;
        let mut progress = Vec::new();
        for row in rows {
            let (layer, alternate, stage, state) = row.map_err(sqlite("read layer progress"))?;
            progress.push(LayerProgress {
                exec_id: id,
                layer,
                alternate,
                stage,
                state: parse_label(id, &state)?,
            });
        }
        Ok(progress)
    }

    fn expect_layers(&self, id: ExecutionId, count: u32) -> Result<bool, LedgerError> {
        self.in_transaction("expect layers", |tx| {
            let current = read_counters(tx, id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            tx.execute(
                "UPDATE geoport_executions SET expected_layers = ?2, last_updated = ?3
                 WHERE exec_id = ?1",
                params![id.to_string(), count, sql_time(unix_now())],
            )
            .map_err(sqlite("record expected layers"))?;
            if !barrier_reached(Some(count), current.completed) {
                return Ok(false);
            }
            mark_completed(tx, id)?;
            Ok(true)
        })
    }

    fn finish_layer(&self, id: ExecutionId, layer: &LayerRef) -> Result<bool, LedgerError> {
        self.in_transaction("finish layer", |tx| {
            let current = read_counters(tx, id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            let now = sql_time(unix_now());
            tx.execute(
                "INSERT INTO geoport_layer_progress (exec_id, layer, alternate, stage, state, updated)
                 VALUES (?1, ?2, ?3, '', ?4, ?5)
                 ON CONFLICT (exec_id, layer) DO UPDATE SET
                    state = excluded.state,
                    updated = excluded.updated",
                params![
                    id.to_string(),
                    layer.name,
                    layer.alternate,
                    LayerState::Done.as_str(),
                    now,
                ],
            )
            .map_err(sqlite("mark layer done"))?;
            let completed: u32 = tx
                .query_row(
                    "SELECT COUNT(*) FROM geoport_layer_progress WHERE exec_id = ?1 AND state = ?2",
                    params![id.to_string(), LayerState::Done.as_str()],
                    |row| row.get(0),
                )
                .map_err(sqlite("count finished layers"))?;
            tx.execute(
                "UPDATE geoport_executions SET completed_layers = ?2, last_updated = ?3
                 WHERE exec_id = ?1",
                params![id.to_string(), completed, now],
            )
            .map_err(sqlite("record finished layers"))?;
            if !barrier_reached(current.expected, completed) {
                return Ok(false);
            }
            mark_completed(tx, id)?;
            Ok(true)
        })
    }
}

struct Counters {
    status: ExecutionStatus,
    expected: Option<u32>,
    completed: u32,
}

fn read_counters(connection: &Connection, id: ExecutionId) -> Result<Counters, LedgerError> {
    let row = connection
        .query_row(
            "SELECT status, expected_layers, completed_layers FROM geoport_executions
             WHERE exec_id = ?1",
            [id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<u32>>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            },
        )
        .optional()
        .map_err(sqlite("read execution status"))?;
    let Some((status, expected, completed)) = row else {
        return Err(LedgerError::NotFound { id });
    };
    Ok(Counters {
        status: parse_label(id, &status)?,
        expected,
        completed,
    })
}

fn load_execution(connection: &Connection, id: ExecutionId) -> Result<ExecutionRequest, LedgerError> {
    let row = connection
        .query_row(
            "SELECT user, status, legacy_status, step, input_params, action, name,
                    legacy_upload_name, source, created, last_updated, expected_layers,
                    completed_layers
             FROM geoport_executions WHERE exec_id = ?1",
            [id.to_string()],
            |row| {
                Ok(StoredExecution {
                    user: row.get(0)?,
                    status: row.get(1)?,
                    legacy_status: row.get(2)?,
                    step: row.get(3)?,
                    input_params: row.get(4)?,
                    action: row.get(5)?,
                    name: row.get(6)?,
                    legacy_upload_name: row.get(7)?,
                    source: row.get(8)?,
                    created: row.get(9)?,
                    last_updated: row.get(10)?,
                    expected_layers: row.get(11)?,
                    completed_layers: row.get(12)?,
                })
            },
        )
        .optional()
        .map_err(sqlite("read execution"))?;
    let Some(stored) = row else {
        return Err(LedgerError::NotFound { id });
    };
    let input_params = serde_json::from_str(&stored.input_params).map_err(|err| {
        LedgerError::Corrupt {
            id: id.to_string(),
            detail: format!("input params: {err}"),
        }
    })?;
    Ok(ExecutionRequest {
        exec_id: id,
        user: stored.user,
        status: parse_label(id, &stored.status)?,
        legacy_status: parse_label(id, &stored.legacy_status)?,
        log: load_log(connection, id)?,
        step: stored.step,
        input_params,
        action: parse_label(id, &stored.action)?,
        name: stored.name,
        legacy_upload_name: stored.legacy_upload_name,
        source: parse_label(id, &stored.source)?,
        created: unix_time(stored.created),
        last_updated: unix_time(stored.last_updated),
        expected_layers: stored.expected_layers,
        completed_layers: stored.completed_layers,
    })
}

struct StoredExecution {
    user: String,
    status: String,
    legacy_status: String,
    step: Option<String>,
    input_params: String,
    action: String,
    name: String,
    legacy_upload_name: String,
    source: String,
    created: i64,
    last_updated: i64,
    expected_layers: Option<u32>,
    completed_layers: u32,
}

fn load_log(connection: &Connection, id: ExecutionId) -> Result<Vec<LogEntry>, LedgerError> {
    let mut statement = connection
        .prepare_cached(
            "SELECT at, message FROM geoport_execution_log WHERE exec_id = ?1 ORDER BY id",
        )
        .map_err(sqlite("prepare log query"))?;
    let rows = statement
        .query_map([id.to_string()], |row| {
            Ok(LogEntry {
                at: unix_time(row.get(0)?),
                message: row.get(1)?,
            })
        })
        .map_err(sqlite("query log"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(sqlite("read log"))
}

fn write_status(
    tx: &Transaction<'_>,
    id: ExecutionId,
    status: ExecutionStatus,
    legacy: LegacyStatus,
) -> Result<(), LedgerError> {
    tx.execute(
        "UPDATE geoport_executions SET status = ?2, legacy_status = ?3, last_updated = ?4
         WHERE exec_id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            legacy.as_str(),
            sql_time(unix_now())
        ],
    )
    .map_err(sqlite("write status"))?;
    Ok(())
}

fn mark_completed(tx: &Transaction<'_>, id: ExecutionId) -> Result<(), LedgerError> {
    write_status(tx, id, ExecutionStatus::Completed, LegacyStatus::Processed)?;
    append_log(tx, id, COMPLETED_LOG)?;
    debug!("execution {id} completed");
    Ok(())
}

fn append_log(tx: &Transaction<'_>, id: ExecutionId, message: &str) -> Result<(), LedgerError> {
    tx.prepare_cached("INSERT INTO geoport_execution_log (exec_id, at, message) VALUES (?1, ?2, ?3)")
        .map_err(sqlite("prepare log insert"))?
        .execute(params![id.to_string(), sql_time(unix_now()), message])
        .map_err(sqlite("append log"))?;
    Ok(())
}

fn parse_label<T>(id: ExecutionId, label: &str) -> Result<T, LedgerError>
where
    T: std::str::FromStr<Err = crate::UnknownLabel>,
{
    label.parse().map_err(|err: crate::UnknownLabel| LedgerError::Corrupt {
        id: id.to_string(),
        detail: err.to_string(),
    })
}

fn sql_time(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn unix_time(secs: i64) -> u64 {
    u64::try_from(secs).unwrap_or_default()
}

fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> LedgerError {
    move |source| LedgerError::Storage {
        operation,
        source: Box::new(source),
    }
}

fn initialise_schema(connection: &mut Connection) -> Result<(), LedgerError> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sqlite("begin ledger schema transaction"))?;

    run_migration_step(
        &transaction,
        "create geoport_executions",
        "CREATE TABLE IF NOT EXISTS geoport_executions (
            exec_id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            status TEXT NOT NULL,
            legacy_status TEXT NOT NULL,
            step TEXT,
            input_params TEXT NOT NULL,
            action TEXT NOT NULL,
            name TEXT NOT NULL,
            legacy_upload_name TEXT NOT NULL,
            source TEXT NOT NULL,
            created INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            expected_layers INTEGER CHECK (expected_layers IS NULL OR expected_layers >= 0),
            completed_layers INTEGER NOT NULL DEFAULT 0
        ) WITHOUT ROWID",
    )?;
    run_migration_step(
        &transaction,
        "create geoport_execution_log",
        "CREATE TABLE IF NOT EXISTS geoport_execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            exec_id TEXT NOT NULL REFERENCES geoport_executions(exec_id) ON DELETE CASCADE,
            at INTEGER NOT NULL,
            message TEXT NOT NULL
        )",
    )?;
    run_migration_step(
        &transaction,
        "index geoport_execution_log",
        "CREATE INDEX IF NOT EXISTS idx_geoport_execution_log_exec
            ON geoport_execution_log(exec_id, id)",
    )?;
    run_migration_step(
        &transaction,
        "create geoport_layer_progress",
        "CREATE TABLE IF NOT EXISTS geoport_layer_progress (
            exec_id TEXT NOT NULL REFERENCES geoport_executions(exec_id) ON DELETE CASCADE,
            layer TEXT NOT NULL,
            alternate TEXT NOT NULL,
            stage TEXT NOT NULL,
            state TEXT NOT NULL,
            updated INTEGER NOT NULL,
            PRIMARY KEY (exec_id, layer)
        ) WITHOUT ROWID",
    )?;
    ensure_schema_version(&transaction)?;

    transaction
        .commit()
        .map_err(sqlite("commit ledger schema transaction"))
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), LedgerError> {
    run_migration_step(
        transaction,
        "create ledger schema version table",
        "CREATE TABLE IF NOT EXISTS geoport_ledger_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0)
        ) WITHOUT ROWID",
    )?;
    let existing: Option<i64> = transaction
        .query_row(
            "SELECT version FROM geoport_ledger_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite("read ledger schema version"))?;
    match existing {
        Some(version) if version == LEDGER_SCHEMA_VERSION => Ok(()),
        Some(found) => Err(LedgerError::VersionMismatch {
            expected: LEDGER_SCHEMA_VERSION,
            found,
        }),
        None => {
            transaction
                .execute(
                    "INSERT INTO geoport_ledger_schema_version (version) VALUES (?1)",
                    [LEDGER_SCHEMA_VERSION],
                )
                .map_err(sqlite("record ledger schema version"))?;
            Ok(())
        }
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), LedgerError> {
    transaction.execute(sql, []).map(|_| ()).map_err(sqlite(step))
}
