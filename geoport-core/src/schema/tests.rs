//! Unit tests for the SQLite schema catalog.

use rstest::{fixture, rstest};

use super::*;

#[fixture]
fn store() -> SqliteSchemaStore {
    SqliteSchemaStore::open_in_memory().expect("open in-memory catalog")
}

fn fields(prefix: &str, count: usize) -> Vec<FieldDescriptor> {
    (0..count)
        .map(|i| FieldDescriptor::new(format!("{prefix}{i}"), FieldKind::Integer))
        .collect()
}

#[rstest]
fn get_or_create_reuses_existing_schema(store: SqliteSchemaStore) {
    let first = store.get_or_create("roads", "alice").expect("create");
    let second = store.get_or_create("roads", "bob").expect("lookup");

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.schema.id, second.schema.id);
    assert_eq!(second.schema.owner, "alice");
    assert_eq!(second.schema.db_name, DEFAULT_DB_NAME);
    assert!(!second.schema.managed);
}

#[rstest]
fn ownership_is_checked_per_user(store: SqliteSchemaStore) {
    store.get_or_create("roads", "alice").expect("create");

    assert!(store.exists_for_owner("roads", "alice").expect("alice"));
    assert!(!store.exists_for_owner("roads", "bob").expect("bob"));
    assert!(!store.exists_for_owner("rivers", "alice").expect("rivers"));
}

#[rstest]
fn batches_insert_each_field_once(store: SqliteSchemaStore) {
    let schema = store.get_or_create("roads", "alice").expect("create").schema;
    let all = fields("f", 130);

    let mut created = 0;
    for batch in all.chunks(50) {
        created += store
            .apply_field_batch(schema.id, batch, false)
            .expect("apply batch")
            .created;
    }

    assert_eq!(created, 130);
    assert_eq!(store.fields(schema.id).expect("fields").len(), 130);
}

#[rstest]
fn existing_fields_are_skipped_without_overwrite(store: SqliteSchemaStore) {
    let schema = store.get_or_create("roads", "alice").expect("create").schema;
    store
        .apply_field_batch(schema.id, &[FieldDescriptor::new("name", FieldKind::Char)], false)
        .expect("first batch");

    let report = store
        .apply_field_batch(
            schema.id,
            &[
                FieldDescriptor::new("name", FieldKind::Integer),
                FieldDescriptor::new("lanes", FieldKind::Integer),
            ],
            false,
        )
        .expect("second batch");

    assert_eq!(
        report,
        BatchReport {
            created: 1,
            updated: 0,
            skipped: 1
        }
    );
    let stored = store.fields(schema.id).expect("fields");
    let name = stored.iter().find(|f| f.name == "name").expect("name field");
    assert_eq!(name.kind, FieldKind::Char);
}

#[rstest]
fn overwrite_updates_fields_in_place(store: SqliteSchemaStore) {
    let schema = store.get_or_create("roads", "alice").expect("create").schema;
    store
        .apply_field_batch(schema.id, &[FieldDescriptor::new("code", FieldKind::Char)], false)
        .expect("first batch");

    let report = store
        .apply_field_batch(
            schema.id,
            &[FieldDescriptor::new("code", FieldKind::BigInteger)],
            true,
        )
        .expect("overwrite batch");

    assert_eq!(report.updated, 1);
    let stored = store.fields(schema.id).expect("fields");
    assert_eq!(stored.len(), 1);
    let code = stored.first().expect("code field");
    assert_eq!(code.kind, FieldKind::BigInteger);
    assert_eq!(code.options.max_length, None);
}

#[rstest]
fn geometry_field_sorts_last(store: SqliteSchemaStore) {
    let schema = store.get_or_create("roads", "alice").expect("create").schema;
    store
        .apply_field_batch(
            schema.id,
            &[FieldDescriptor::new(
                "geom",
                FieldKind::Geometry(GeometryKind::LineString),
            )],
            false,
        )
        .expect("geometry batch");
    store
        .apply_field_batch(schema.id, &fields("a", 2), false)
        .expect("attribute batch");

    let names: Vec<_> = store
        .fields(schema.id)
        .expect("fields")
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["a0", "a1", "geom"]);
}

#[rstest]
fn unknown_schema_is_reported(store: SqliteSchemaStore) {
    let err = store
        .apply_field_batch(SchemaId(404), &fields("x", 1), false)
        .expect_err("unknown schema");
    assert!(matches!(err, SchemaStoreError::NotFound { id: SchemaId(404) }));
    assert!(matches!(
        store.realize(SchemaId(404)),
        Err(SchemaStoreError::NotFound { .. })
    ));
}

#[rstest]
fn realize_returns_complete_model(store: SqliteSchemaStore) {
    let schema = store.get_or_create("roads", "alice").expect("create").schema;
    store
        .apply_field_batch(schema.id, &fields("c", 3), false)
        .expect("batch");

    let handle = store.realize(schema.id).expect("realize");
    assert_eq!(handle.table_name(), "roads");
    assert_eq!(handle.schema.fields.len(), 3);
}
