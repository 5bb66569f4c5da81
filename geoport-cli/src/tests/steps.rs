//! Behaviour-driven step definitions driving the import CLI scenarios.

use super::helpers::Workspace;
use super::*;
use clap::Parser;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::cell::RefCell;

/// Aggregates import CLI scenario state so each step only needs a single
/// world argument.
struct ImportWorld {
    workspace: Workspace,
    cli_args: RefCell<Vec<String>>,
    outcome: RefCell<Option<Result<serde_json::Value, CliError>>>,
}

impl ImportWorld {
    fn new() -> Self {
        Self {
            workspace: Workspace::new(),
            cli_args: RefCell::new(Vec::new()),
            outcome: RefCell::new(None),
        }
    }

    fn invoke(&self, args: Vec<String>) -> Result<serde_json::Value, CliError> {
        let cli = Cli::try_parse_from(args).map_err(CliError::ArgumentParsing)?;
        let mut out = Vec::new();
        execute(cli.command, &mut out)?;
        Ok(serde_json::from_slice(&out).expect("command output should be JSON"))
    }

    fn printed(&self) -> serde_json::Value {
        let borrowed = self.outcome.borrow();
        match borrowed.as_ref().expect("command should have run") {
            Ok(value) => value.clone(),
            Err(err) => panic!("expected success, found {err:?}"),
        }
    }
}

#[fixture]
fn world() -> ImportWorld {
    ImportWorld::new()
}

#[given("a GeoPackage with a roads layer")]
fn geopackage(#[from(world)] world: &ImportWorld) {
    world.workspace.geopackage(&["roads"]);
}

#[given("I pass the database and GeoPackage paths with CLI flags")]
fn cli_provides_paths(#[from(world)] world: &ImportWorld) {
    let root = world.workspace.root();
    world.cli_args.borrow_mut().extend([
        format!("--{ARG_DATABASE}"),
        world.workspace.database().to_string(),
        format!("--{ARG_BASE_FILE}"),
        root.join("upload.gpkg").to_string(),
        format!("--{ARG_USER}"),
        "alice".to_owned(),
    ]);
}

#[given("the loader binary is {binary}")]
fn loader_binary(#[from(world)] world: &ImportWorld, binary: String) {
    world
        .cli_args
        .borrow_mut()
        .extend([format!("--{ARG_OGR2OGR}"), binary]);
}

#[given("I pass only the database flag")]
fn only_database(#[from(world)] world: &ImportWorld) {
    world.cli_args.borrow_mut().extend([
        format!("--{ARG_DATABASE}"),
        world.workspace.database().to_string(),
    ]);
}

#[when("I run the import command")]
fn run_import_command(#[from(world)] world: &ImportWorld) {
    let mut invocation = vec!["geoport".to_owned(), "import".to_owned()];
    invocation.extend(world.cli_args.borrow().iter().cloned());
    let outcome = world.invoke(invocation);
    world.outcome.replace(Some(outcome));
}

#[then("the command prints a completed execution")]
fn prints_completed(#[from(world)] world: &ImportWorld) {
    let printed = world.printed();
    assert_eq!(printed["status"], "completed");
    assert_eq!(printed["expected_layers"], 1);
}

#[then("the command prints a failed execution")]
fn prints_failed(#[from(world)] world: &ImportWorld) {
    assert_eq!(world.printed()["status"], "failed");
}

#[then("the status command reports the same execution")]
fn status_matches(#[from(world)] world: &ImportWorld) {
    let printed = world.printed();
    let exec_id = printed["exec_id"]
        .as_str()
        .expect("exec_id should be a string")
        .to_owned();
    let status = world
        .invoke(vec![
            "geoport".to_owned(),
            "status".to_owned(),
            exec_id.clone(),
            format!("--{ARG_DATABASE}"),
            world.workspace.database().to_string(),
        ])
        .expect("status succeeds");
    assert_eq!(status["exec_id"], exec_id);
    assert_eq!(status["status"], "completed");
}

#[then("the CLI reports that the base-file flag is missing")]
fn reports_missing_base_file(#[from(world)] world: &ImportWorld) {
    let borrowed = world.outcome.borrow();
    let error = borrowed
        .as_ref()
        .expect("result recorded")
        .as_ref()
        .expect_err("expected error");
    match error {
        CliError::MissingArgument { field, .. } => assert_eq!(*field, ARG_BASE_FILE),
        other => panic!("unexpected error {other:?}"),
    }
}

macro_rules! register_import_scenario {
    ($fn_name:ident, $scenario_title:literal) => {
        #[scenario(path = "tests/features/import_command.feature", name = $scenario_title)]
        fn $fn_name(#[from(world)] world: ImportWorld) {
            let _ = world;
        }
    };
}

register_import_scenario!(importing_end_to_end, "importing a GeoPackage end to end");
register_import_scenario!(
    reporting_loader_failures,
    "reporting loader failures through the execution"
);
register_import_scenario!(rejecting_missing_base_file, "rejecting a missing GeoPackage flag");
