//! Behavioural tests for `SqliteExecutionLedger` using rstest-bdd.
#![cfg(feature = "store-sqlite")]

use std::cell::RefCell;

use geoport_core::{
    Action, ExecutionId, ExecutionLedger, ExecutionSource, ExecutionStatus, ExecutionUpdate,
    InputParams, LayerRef, LedgerError, LegacyStatus, NewExecution, SqliteExecutionLedger,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

/// Shared state for ledger scenarios.
struct LedgerWorld {
    ledger: RefCell<Option<SqliteExecutionLedger>>,
    execution: RefCell<Option<ExecutionId>>,
    update_error: RefCell<Option<LedgerError>>,
}

impl LedgerWorld {
    fn with_ledger<T>(&self, f: impl FnOnce(&SqliteExecutionLedger) -> T) -> T {
        let borrowed = self.ledger.borrow();
        let ledger = borrowed
            .as_ref()
            .expect("ledger should be opened before use");
        f(ledger)
    }

    fn id(&self) -> ExecutionId {
        self.execution
            .borrow()
            .expect("execution should be created before use")
    }
}

#[fixture]
fn world() -> LedgerWorld {
    LedgerWorld {
        ledger: RefCell::new(None),
        execution: RefCell::new(None),
        update_error: RefCell::new(None),
    }
}

#[given("an empty SQLite execution ledger")]
fn empty_ledger(world: &LedgerWorld) {
    let ledger = SqliteExecutionLedger::open_in_memory().expect("open in-memory ledger");
    world.ledger.replace(Some(ledger));
}

#[when("an import execution is created for {user}")]
fn create_execution(world: &LedgerWorld, user: String) {
    let id = world.with_ledger(|ledger| {
        ledger
            .create(NewExecution {
                user,
                input_params: InputParams::default(),
                action: Action::Import,
                name: "roads".into(),
                legacy_upload_name: "roads.gpkg".into(),
                source: ExecutionSource::Upload,
                step: None,
            })
            .expect("create execution")
    });
    world.execution.replace(Some(id));
}

#[when("the execution fails because the loader exploded")]
fn fail_execution(world: &LedgerWorld) {
    let id = world.id();
    let changed = world.with_ledger(|ledger| ledger.set_failed(id, "loader exploded"));
    assert!(changed.expect("first failure"));
}

#[when("the execution fails again for another reason")]
fn fail_again(world: &LedgerWorld) {
    let id = world.id();
    let changed = world.with_ledger(|ledger| ledger.set_failed(id, "second failure"));
    assert!(!changed.expect("second failure"));
}

#[when("the execution expects {count} layers")]
fn expect_layers(world: &LedgerWorld, count: u32) {
    let id = world.id();
    world
        .with_ledger(|ledger| ledger.expect_layers(id, count))
        .expect("record expected layers");
}

#[when("layer {name} finishes")]
fn finish_layer(world: &LedgerWorld, name: String) {
    let id = world.id();
    let layer = LayerRef::new(name.clone(), name);
    world
        .with_ledger(|ledger| ledger.finish_layer(id, &layer))
        .expect("finish layer");
}

#[when("the execution is moved back to pending")]
fn move_back(world: &LedgerWorld) {
    let id = world.id();
    let update = ExecutionUpdate {
        status: Some(ExecutionStatus::Pending),
        ..ExecutionUpdate::default()
    };
    let outcome = world.with_ledger(|ledger| ledger.update(id, update));
    world.update_error.replace(outcome.err());
}

#[then("the execution is running with the creation log line")]
fn running_with_log(world: &LedgerWorld) {
    let id = world.id();
    let record = world.with_ledger(|ledger| ledger.get(id)).expect("fetch");
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.log.len(), 1);
}

#[then("the execution is failed because the loader exploded")]
fn failed_with_first_reason(world: &LedgerWorld) {
    let id = world.id();
    let record = world.with_ledger(|ledger| ledger.get(id)).expect("fetch");
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.legacy_status, LegacyStatus::Invalid);
    assert_eq!(record.last_log(), Some("loader exploded"));
}

#[then("the execution is completed")]
fn completed(world: &LedgerWorld) {
    let id = world.id();
    let record = world.with_ledger(|ledger| ledger.get(id)).expect("fetch");
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.legacy_status, LegacyStatus::Processed);
    assert_eq!(record.completed_layers, 2);
}

#[then("the update is rejected as an invalid transition")]
fn rejected(world: &LedgerWorld) {
    let binding = world.update_error.borrow();
    let error = binding.as_ref().expect("an error should be recorded");
    assert!(matches!(error, LedgerError::InvalidTransition { .. }));
}

#[scenario(path = "tests/features/execution_ledger.feature", index = 0)]
fn created_execution_is_running(world: LedgerWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/execution_ledger.feature", index = 1)]
fn failing_twice_keeps_first_reason(world: LedgerWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/execution_ledger.feature", index = 2)]
fn barrier_completes_execution(world: LedgerWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/execution_ledger.feature", index = 3)]
fn backward_transition_rejected(world: LedgerWorld) {
    let _ = world;
}
