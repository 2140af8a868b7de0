use std::time::Duration;

use runbook_engine::{
    Dispatcher, EngineConfig, EngineError, RunContext, RunOptions, ScriptBody, ScriptService, UndefinedVariablePolicy,
    resolve::resolve_value, variables::VariableStore,
};
use runbook_types::{ErrorKind, RunStatus};
use serde_json::{Map, Value, json};

fn script(value: Value) -> ScriptBody {
    serde_json::from_value(value).expect("script body")
}

fn service() -> ScriptService {
    ScriptService::with_builtins(EngineConfig::default()).expect("service")
}

async fn run_to_end(value: Value) -> (RunContext, Result<String, runbook_types::StepOutcome>) {
    let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
    let run = RunContext::new("scenario", RunOptions { log_history: true }, dispatcher.config());
    let result = run.execute(&dispatcher, &script(value)).await;
    (run, result)
}

#[tokio::test]
async fn set_var_scripts_replay_to_the_same_store() {
    let body = json!({"steps": [
        {"action": "set_var", "name": "a", "value": "1"},
        {"action": "set_var", "name": "b", "value": "${a}-x"},
        {"action": "set_var", "name": "a", "value": 2},
        {"action": "set_var", "name": "c", "value": ["${a}", "${b}"]},
    ]});
    let (first, _) = run_to_end(body.clone()).await;
    let (second, _) = run_to_end(body).await;

    let expected = json!({"a": 2, "b": "1-x", "c": ["2", "1-x"]});
    assert_eq!(Value::Object(first.variables()), expected);
    assert_eq!(first.variables(), second.variables());
}

#[test]
fn resolution_is_idempotent_once_placeholders_are_gone() {
    let mut variables = VariableStore::new();
    variables.set("host", json!("db.internal"));
    variables.set("port", json!(5432));
    variables.set("tags", json!(["a", "b"]));

    for value in [
        json!("postgres://${host}:${port}/app"),
        json!({"nested": {"list": ["${tags}", 1, null, "${port}"]}}),
        json!("no placeholders at all"),
    ] {
        let once = resolve_value(&value, &variables, UndefinedVariablePolicy::Preserve).expect("first pass");
        let twice = resolve_value(&once, &variables, UndefinedVariablePolicy::Preserve).expect("second pass");
        assert_eq!(once, twice, "{value}");
    }
}

#[tokio::test]
async fn counting_loop_runs_exactly_four_times() {
    let (run, result) = run_to_end(json!({"steps": [
        {"action": "set_var", "name": "i", "value": 0},
        {"action": "loop", "condition": "${i} < 4", "loop_steps": [
            {"action": "set_var", "name": "i", "value": "${i} + 1", "eval": true},
            {"action": "print_msg", "message": "pass ${i}"},
        ]},
    ]}))
    .await;

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(run.variable("i"), Some(json!(4)));
    assert_eq!(run.output().lines(), vec!["pass 1", "pass 2", "pass 3", "pass 4"]);
    let loop_entry = run.history().into_iter().last().expect("loop entry");
    assert_eq!(loop_entry.action, "loop");
    assert_eq!(loop_entry.outcome.message, "Executed 4 iterations");
}

#[tokio::test]
async fn host_access_in_expressions_is_always_rejected() {
    let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
    let run = RunContext::new("unsafe", RunOptions::default(), dispatcher.config());
    for needle in ["import", "__class__", "os.", "eval("] {
        for expression in [needle.to_string(), format!("1 + {needle}"), format!("[x]{needle}y"), format!("'{needle}'")] {
            let step = runbook_types::Step::from_value(&json!({"action": "eval", "expression": expression})).expect("step");
            let outcome = dispatcher.dispatch(&step, &run).await;
            assert_eq!(outcome.error_kind, Some(ErrorKind::UnsafeExpression), "{expression}");
        }
    }
}

#[tokio::test]
async fn destructive_commands_never_spawn() {
    let (run, result) = run_to_end(json!({"steps": [
        {"action": "execute_command", "command": "rm -rf /"},
    ]}))
    .await;

    let failure = result.expect_err("rejected");
    assert_eq!(failure.error_kind, Some(ErrorKind::UnsafeCommand));
    assert_eq!(run.status(), RunStatus::Error);
    assert!(run.variable("exit_code").is_none());
    assert!(run.output().is_empty());
}

#[tokio::test]
async fn condition_scenario_completes_with_expected_variables() {
    let service = service();
    let run_id = service.create_run(
        script(json!({"steps": [
            {"action": "set_var", "name": "a", "value": "2"},
            {"action": "set_var", "name": "b", "value": "3"},
            {"action": "condition", "condition": "${a} + ${b} == 5",
             "if_true": [{"action": "set_var", "name": "ok", "value": "yes"}],
             "if_false": [{"action": "set_var", "name": "ok", "value": "no"}]},
        ]})),
        Map::new(),
        RunOptions::default(),
    );

    let status = service.wait_for_completion(&run_id).await.expect("run exists");
    assert_eq!(status.status, RunStatus::Completed);
    assert!(status.error.is_none());
    assert_eq!(
        Value::Object(service.get_variables(&run_id).expect("variables")),
        json!({"a": "2", "b": "3", "ok": "yes"})
    );
}

#[tokio::test]
async fn unknown_action_fails_the_run_and_leaves_variables_alone() {
    let service = service();
    let mut initial = Map::new();
    initial.insert("keep".into(), json!("me"));
    let run_id = service.create_run(
        script(json!({"steps": [{"action": "bogus_action", "name": "x", "value": 1}]})),
        initial.clone(),
        RunOptions::default(),
    );

    let status = service.wait_for_completion(&run_id).await.expect("run exists");
    assert_eq!(status.status, RunStatus::Error);
    let error = status.error.expect("error outcome");
    assert_eq!(error.error_kind, Some(ErrorKind::UnknownAction));
    assert_eq!(error.message, "Unsupported action type: bogus_action");
    assert_eq!(service.get_variables(&run_id).expect("variables"), initial);
}

#[tokio::test]
async fn deleting_a_run_mid_delay_releases_it() {
    let service = service();
    let run_id = service.create_run(
        script(json!({"steps": [
            {"action": "delay", "seconds": 30},
            {"action": "set_var", "name": "after", "value": "ran"},
        ]})),
        Map::new(),
        RunOptions::default(),
    );
    let run = service.get_run(&run_id).expect("run exists");
    let mut status = run.watch_status();
    status
        .wait_for(|status| matches!(status, RunStatus::Executing { .. }))
        .await
        .expect("run started");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(service.delete_run(&run_id));
    assert!(matches!(service.get_status(&run_id), Err(EngineError::RunNotFound { .. })));

    tokio::time::timeout(Duration::from_secs(5), status.wait_for(RunStatus::is_terminal))
        .await
        .expect("released promptly")
        .expect("status channel open");
    assert_eq!(run.status(), RunStatus::Error);
    assert_eq!(run.status_snapshot().error.and_then(|error| error.error_kind), Some(ErrorKind::Cancelled));
    assert!(run.variable("after").is_none());
}

#[tokio::test]
async fn legacy_snippets_run_through_the_service() {
    let service = service();
    let run_id = service.create_run(
        ScriptBody::from_text("total = 2 + 3\nprint('total', total)\n").expect("legacy text"),
        Map::new(),
        RunOptions::default(),
    );
    let status = service.wait_for_completion(&run_id).await.expect("run exists");
    assert_eq!(status.status, RunStatus::Completed);
    assert_eq!(service.get_output(&run_id).expect("output"), vec!["total 5"]);
}

#[tokio::test]
async fn output_streams_to_live_consumers() {
    let dispatcher = Dispatcher::with_builtins(EngineConfig::default()).expect("dispatcher");
    let run = RunContext::new("stream", RunOptions::default(), dispatcher.config());
    let body = script(json!({"steps": [
        {"action": "delay", "seconds": 0.05},
        {"action": "print_msg", "message": "first"},
        {"action": "print_msg", "message": "second"},
    ]}));

    let mut received = Vec::new();
    let (delivered, result) = tokio::join!(
        run.flush_output(|line| received.push(line), Duration::from_secs(5)),
        run.execute(&dispatcher, &body),
    );
    assert!(result.is_ok());
    assert_eq!(delivered, 2);
    assert_eq!(received, vec!["first", "second"]);
}
