//! SQLite-backed catalog of dynamic layer schemas.
#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use camino::Utf8Path;
use log::debug;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter};

use crate::unix_now;

use super::{
    BatchReport, DEFAULT_DB_NAME, FieldDescriptor, FieldKind, FieldOptions, LayerSchema, ModelHandle,
    SchemaId, SchemaLookup, SchemaStore, SchemaStoreError,
};

const CATALOG_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Columns bound per inserted field row.
const FIELD_COLUMNS: usize = 5;

/// Layer schema catalog persisted in SQLite.
///
/// # Examples
///
/// ```
/// use geoport_core::{FieldDescriptor, FieldKind, SchemaStore, SqliteSchemaStore};
///
/// let store = SqliteSchemaStore::open_in_memory().expect("open catalog");
/// let lookup = store.get_or_create("roads", "alice").expect("create schema");
/// assert!(lookup.created);
///
/// let report = store
///     .apply_field_batch(
///         lookup.schema.id,
///         &[FieldDescriptor::new("name", FieldKind::Char)],
///         false,
///     )
///     .expect("insert batch");
/// assert_eq!(report.created, 1);
/// ```
#[derive(Debug)]
pub struct SqliteSchemaStore {
    connection: Mutex<Connection>,
}

impl SqliteSchemaStore {
    /// Open (or create) a catalog database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::Storage`] when the database cannot be
    /// opened or migrated.
    pub fn open(path: &Utf8Path) -> Result<Self, SchemaStoreError> {
        let connection = Connection::open(path.as_std_path()).map_err(sqlite("open database"))?;
        Self::from_connection(connection)
    }

    /// Open a private in-memory catalog.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaStoreError::Storage`] when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, SchemaStoreError> {
        let connection = Connection::open_in_memory().map_err(sqlite("open database"))?;
        Self::from_connection(connection)
    }

    fn from_connection(mut connection: Connection) -> Result<Self, SchemaStoreError> {
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

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SchemaStoreError> {
        self.connection.lock().map_err(|_| SchemaStoreError::Poisoned)
    }

    fn in_transaction<T>(
        &self,
        operation: &'static str,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, SchemaStoreError>,
    ) -> Result<T, SchemaStoreError> {
        let mut connection = self.lock()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sqlite(operation))?;
        let value = body(&transaction)?;
        transaction.commit().map_err(sqlite(operation))?;
        Ok(value)
    }
}

impl SchemaStore for SqliteSchemaStore {
    fn get_or_create(&self, name: &str, owner: &str) -> Result<SchemaLookup, SchemaStoreError> {
        self.in_transaction("get or create schema", |tx| {
            if let Some(schema) = find_by_name(tx, name)? {
                return Ok(SchemaLookup {
                    schema,
                    created: false,
                });
            }
            tx.execute(
                "INSERT INTO geoport_layer_schemas (name, db_name, managed, owner, created)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![name, DEFAULT_DB_NAME, owner, sql_time(unix_now())],
            )
            .map_err(sqlite("insert schema"))?;
            let id = SchemaId(tx.last_insert_rowid());
            debug!("created layer schema '{name}' ({id:?}) for {owner}");
            Ok(SchemaLookup {
                schema: LayerSchema {
                    id,
                    name: name.to_owned(),
                    db_name: DEFAULT_DB_NAME.to_owned(),
                    managed: false,
                    owner: owner.to_owned(),
                    fields: Vec::new(),
                },
                created: true,
            })
        })
    }

    fn exists_for_owner(&self, name: &str, owner: &str) -> Result<bool, SchemaStoreError> {
        let connection = self.lock()?;
        connection
            .query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM geoport_layer_schemas WHERE name = ?1 AND owner = ?2
                 )",
                params![name, owner],
                |row| row.get(0),
            )
            .map_err(sqlite("check schema ownership"))
    }

    fn apply_field_batch(
        &self,
        schema: SchemaId,
        batch: &[FieldDescriptor],
        overwrite: bool,
    ) -> Result<BatchReport, SchemaStoreError> {
        self.in_transaction("apply field batch", |tx| {
            ensure_schema(tx, schema)?;
            let existing = existing_field_names(tx, schema)?;
            let mut pending: HashSet<&str> = HashSet::new();
            let mut report = BatchReport::default();
            let mut inserts = Vec::new();

            for field in batch {
                if existing.contains(&field.name) {
                    if overwrite {
                        update_field(tx, schema, field)?;
                        report.updated += 1;
                    } else {
                        report.skipped += 1;
                    }
                } else if pending.insert(field.name.as_str()) {
                    inserts.push(field);
                } else {
                    report.skipped += 1;
                }
            }

            insert_fields(tx, schema, &inserts)?;
            report.created = inserts.len();
            Ok(report)
        })
    }

    fn fields(&self, schema: SchemaId) -> Result<Vec<FieldDescriptor>, SchemaStoreError> {
        let connection = self.lock()?;
        ensure_schema(&connection, schema)?;
        load_fields(&connection, schema)
    }

    fn realize(&self, schema: SchemaId) -> Result<ModelHandle, SchemaStoreError> {
        self.in_transaction("realize schema", |tx| {
            let updated = tx
                .execute(
                    "UPDATE geoport_layer_schemas SET realized_at = ?2 WHERE id = ?1",
                    params![schema.0, sql_time(unix_now())],
                )
                .map_err(sqlite("mark schema realized"))?;
            if updated == 0 {
                return Err(SchemaStoreError::NotFound { id: schema });
            }
            let realized = find_by_id(tx, schema)?.ok_or(SchemaStoreError::NotFound { id: schema })?;
            Ok(ModelHandle { schema: realized })
        })
    }
}

fn find_by_name(
    connection: &Connection,
    name: &str,
) -> Result<Option<LayerSchema>, SchemaStoreError> {
    let header = connection
        .query_row(
            "SELECT id FROM geoport_layer_schemas WHERE name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(sqlite("find schema by name"))?;
    match header {
        Some(id) => find_by_id(connection, SchemaId(id)),
        None => Ok(None),
    }
}

fn find_by_id(
    connection: &Connection,
    id: SchemaId,
) -> Result<Option<LayerSchema>, SchemaStoreError> {
    let header = connection
        .query_row(
            "SELECT name, db_name, managed, owner FROM geoport_layer_schemas WHERE id = ?1",
            [id.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(sqlite("read schema"))?;
    let Some((name, db_name, managed, owner)) = header else {
        return Ok(None);
    };
    Ok(Some(LayerSchema {
        id,
        name,
        db_name,
        managed,
        owner,
        fields: load_fields(connection, id)?,
    }))
}

fn ensure_schema(connection: &Connection, id: SchemaId) -> Result<(), SchemaStoreError> {
    let exists: bool = connection
        .query_row(
            "SELECT EXISTS (SELECT 1 FROM geoport_layer_schemas WHERE id = ?1)",
            [id.0],
            |row| row.get(0),
        )
        .map_err(sqlite("check schema"))?;
    if exists {
        Ok(())
    } else {
        Err(SchemaStoreError::NotFound { id })
    }
}

fn existing_field_names(
    connection: &Connection,
    schema: SchemaId,
) -> Result<HashSet<String>, SchemaStoreError> {
    let mut statement = connection
        .prepare_cached("SELECT name FROM geoport_schema_fields WHERE schema_id = ?1")
        .map_err(sqlite("prepare field name query"))?;
    let names = statement
        .query_map([schema.0], |row| row.get::<_, String>(0))
        .map_err(sqlite("query field names"))?
        .collect::<Result<HashSet<_>, _>>()
        .map_err(sqlite("read field names"))?;
    Ok(names)
}

fn load_fields(
    connection: &Connection,
    schema: SchemaId,
) -> Result<Vec<FieldDescriptor>, SchemaStoreError> {
    // Geometry columns sort last regardless of which batch landed first.
    let mut statement = connection
        .prepare_cached(
            "SELECT name, kind, nullable, max_length FROM geoport_schema_fields
             WHERE schema_id = ?1
             ORDER BY kind LIKE 'geometry:%', id",
        )
        .map_err(sqlite("prepare field query"))?;
    let rows = statement
        .query_map([schema.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<u32>>(3)?,
            ))
        })
        .map_err(sqlite("query fields"))?;

    let mut fields = Vec::new();
    for row in rows {
        let (name, kind, nullable, max_length) = row.map_err(sqlite("read field"))?;
        let kind = kind
            .parse::<FieldKind>()
            .map_err(|err| SchemaStoreError::Corrupt {
                id: schema,
                field: name.clone(),
                detail: err.to_string(),
            })?;
        fields.push(FieldDescriptor {
            name,
            kind,
            nullable,
            options: FieldOptions { max_length },
        });
    }
    Ok(fields)
}

fn update_field(
    tx: &Transaction<'_>,
    schema: SchemaId,
    field: &FieldDescriptor,
) -> Result<(), SchemaStoreError> {
    tx.prepare_cached(
        "UPDATE geoport_schema_fields SET kind = ?3, nullable = ?4, max_length = ?5
         WHERE schema_id = ?1 AND name = ?2",
    )
    .map_err(sqlite("prepare field update"))?
    .execute(params![
        schema.0,
        field.name,
        field.kind.to_string(),
        field.nullable,
        field.options.max_length,
    ])
    .map_err(sqlite("update field"))?;
    Ok(())
}

fn insert_fields(
    tx: &Transaction<'_>,
    schema: SchemaId,
    fields: &[&FieldDescriptor],
) -> Result<(), SchemaStoreError> {
    if fields.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["(?, ?, ?, ?, ?)"; fields.len()].join(", ");
    let sql = format!(
        "INSERT INTO geoport_schema_fields (schema_id, name, kind, nullable, max_length)
         VALUES {placeholders}"
    );
    let mut values = Vec::with_capacity(fields.len() * FIELD_COLUMNS);
    for field in fields {
        values.push(Value::Integer(schema.0));
        values.push(Value::Text(field.name.clone()));
        values.push(Value::Text(field.kind.to_string()));
        values.push(Value::Integer(i64::from(field.nullable)));
        values.push(
            field
                .options
                .max_length
                .map_or(Value::Null, |len| Value::Integer(i64::from(len))),
        );
    }
    tx.execute(&sql, params_from_iter(values.iter()))
        .map_err(sqlite("insert fields"))?;
    Ok(())
}

fn sql_time(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> SchemaStoreError {
    move |source| SchemaStoreError::Storage {
        operation,
        source: Box::new(source),
    }
}

fn initialise_schema(connection: &mut Connection) -> Result<(), SchemaStoreError> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sqlite("begin catalog schema transaction"))?;

    run_migration_step(
        &transaction,
        "create geoport_layer_schemas",
        "CREATE TABLE IF NOT EXISTS geoport_layer_schemas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0),
            db_name TEXT NOT NULL,
            managed INTEGER NOT NULL,
            owner TEXT NOT NULL,
            created INTEGER NOT NULL,
            realized_at INTEGER
        )",
    )?;
    run_migration_step(
        &transaction,
        "create geoport_schema_fields",
        "CREATE TABLE IF NOT EXISTS geoport_schema_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            schema_id INTEGER NOT NULL REFERENCES geoport_layer_schemas(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            nullable INTEGER NOT NULL,
            max_length INTEGER
        )",
    )?;
    run_migration_step(
        &transaction,
        "index geoport_schema_fields",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_geoport_schema_fields_name
            ON geoport_schema_fields(schema_id, name)",
    )?;
    ensure_schema_version(&transaction)?;

    transaction
        .commit()
        .map_err(sqlite("commit catalog schema transaction"))
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), SchemaStoreError> {
    run_migration_step(
        transaction,
        "create catalog schema version table",
        "CREATE TABLE IF NOT EXISTS geoport_catalog_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0)
        ) WITHOUT ROWID",
    )?;
    let existing: Option<i64> = transaction
        .query_row(
            "SELECT version FROM geoport_catalog_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite("read catalog schema version"))?;
    match existing {
        Some(version) if version == CATALOG_SCHEMA_VERSION => Ok(()),
        Some(found) => Err(SchemaStoreError::VersionMismatch {
            expected: CATALOG_SCHEMA_VERSION,
            found,
        }),
        None => {
            transaction
                .execute(
                    "INSERT INTO geoport_catalog_schema_version (version) VALUES (?1)",
                    [CATALOG_SCHEMA_VERSION],
                )
                .map_err(sqlite("record catalog schema version"))?;
            Ok(())
        }
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), SchemaStoreError> {
    transaction.execute(sql, []).map(|_| ()).map_err(sqlite(step))
}
