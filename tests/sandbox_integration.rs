//! End-to-end tests: supervisor -> scriptbox worker process -> result.
//!
//! Every test launches the real binary in its worker role, so these cover
//! the IPC exchange and the OS-level limits as well as the script runtime.

use scriptbox::{
    ErrorKind, ExecutionRequest, ExecutionResult, PermissionList, Policy, Supervisor,
    SupervisorConfig,
};
use serde_json::{json, Map, Value};
use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_scriptbox");

fn supervisor() -> Supervisor {
    Supervisor::new(SupervisorConfig::new(BIN))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn execute(code: &str, input: Value, policy: Policy) -> ExecutionResult {
    let request = ExecutionRequest::new(code)
        .with_input(object(input))
        .with_policy(policy);
    supervisor().execute(&request)
}

#[test]
fn test_math_sqrt_of_input() {
    let result = execute(
        r#"import "math" as math; result = math::sqrt(float(input_data.x));"#,
        json!({"x": 81}),
        Policy::default(),
    );
    assert!(result.ok, "{result:?}");
    assert_eq!(result.result, json!(9.0));
    assert_eq!(result.exit_code, 0);
    assert!(!result.timed_out);
}

#[test]
fn test_infinite_loop_times_out() {
    let policy = Policy::new(1, 256, 30, 128).unwrap();
    let result = execute("loop {}", json!({}), policy);

    assert!(!result.ok);
    assert!(result.timed_out);
    assert_eq!(result.exit_code, 124);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(result.error.as_deref(), Some("Execution timed out after 1s"));
    // Deadline plus startup grace, with room for a slow reap.
    assert!(result.wall_time_ms < 5_000, "took {}ms", result.wall_time_ms);
}

#[test]
fn test_sleeping_script_times_out() {
    let policy = Policy::new(1, 256, 5, 128).unwrap();
    let result = execute(r#"import "time" as t; t::sleep(10);"#, json!({}), policy);

    assert!(!result.ok);
    assert!(result.timed_out);
    assert_eq!(result.exit_code, 124);
    assert!(result.wall_time_ms < 5_000, "took {}ms", result.wall_time_ms);
}

#[test]
fn test_cpu_budget_is_enforced_before_the_deadline() {
    let policy = Policy::new(10, 256, 1, 128).unwrap();
    let result = execute("let n = 0; loop { n += 1; }", json!({}), policy);

    assert!(!result.ok);
    assert!(!result.timed_out);
    assert!(result.resource_exceeded);
}

#[test]
fn test_runaway_memory_is_reported() {
    let policy = Policy::new(10, 64, 10, 128).unwrap();
    let result = execute(r#"let s = "xxxxxxxx"; loop { s += s; }"#, json!({}), policy);

    // Either the engine ceiling or the address-space limit trips first.
    assert!(!result.ok);
    assert!(result.resource_exceeded, "{result:?}");
}

#[test]
fn test_blocked_import_reaches_the_caller() {
    let result = execute(r#"import "os" as os; result = os::getcwd();"#, json!({}), Policy::default());
    assert!(!result.ok);
    assert_eq!(result.error_kind, Some(ErrorKind::ImportBlocked));
    assert!(result.error.unwrap_or_default().contains("os"));
}

#[test]
fn test_block_list_policy_still_blocks_named_modules() {
    let policy = Policy::default().with_imports(PermissionList::block(["os"]));
    let result = execute(r#"import "os.path" as p; result = p::exists("/");"#, json!({}), policy);
    assert_eq!(result.error_kind, Some(ErrorKind::ImportBlocked));
}

#[test]
fn test_removed_builtin_is_not_defined() {
    let result = execute(r#"result = open("/etc/hostname");"#, json!({}), Policy::default());
    assert!(!result.ok);
    assert_eq!(result.error_kind, Some(ErrorKind::PrimitiveUnavailable));
    assert!(result.error.unwrap_or_default().contains("is not defined"));
}

#[test]
fn test_stdout_is_truncated() {
    let policy = Policy::new(5, 256, 5, 10).unwrap();
    let result = execute(
        r#"for i in 0..5000 { print("0123456789"); } result = 1;"#,
        json!({}),
        policy,
    );
    assert!(result.ok, "{result:?}");
    assert!(result.stdout.len() <= 10 * 1024);
    assert!(result.stdout.len() >= 9 * 1024);
}

#[test]
fn test_result_over_response_cap_is_a_serialization_error() {
    let supervisor =
        Supervisor::new(SupervisorConfig::new(BIN).with_max_response_bytes(256 * 1024));
    let request = ExecutionRequest::new(
        r#"let s = "x"; while s.len() < 1000000 { s += s; } result = s;"#,
    );
    let result = supervisor.execute(&request);

    assert!(!result.ok);
    assert_eq!(result.error_kind, Some(ErrorKind::SerializationError), "{result:?}");
    assert!(result.error.unwrap_or_default().contains("too large"));
    assert_eq!(result.exit_code, 0);
    assert!(!result.resource_exceeded);
}

#[test]
fn test_result_json_fidelity() {
    let result = execute(
        r#"result = #{is_valid: true, none_val: (), pi: 3.14159, list_val: [1, 2, 3]};"#,
        json!({}),
        Policy::default(),
    );
    assert!(result.ok, "{result:?}");
    assert_eq!(
        result.result,
        json!({"is_valid": true, "none_val": null, "pi": 3.14159, "list_val": [1, 2, 3]})
    );
}

#[test]
fn test_reserved_input_key_cannot_preset_result() {
    let result = execute("", json!({"result": "malicious"}), Policy::default());
    assert!(result.ok);
    assert_eq!(result.result, Value::Null);
}

#[test]
fn test_executions_are_isolated() {
    let first = execute("let leaked = 42; result = leaked;", json!({}), Policy::default());
    assert_eq!(first.result, json!(42));

    let second = execute("result = leaked;", json!({}), Policy::default());
    assert!(!second.ok);
    assert!(second.error.unwrap_or_default().contains("NameError"));
}

#[test]
fn test_cli_run_prints_result() {
    let output = Command::new(BIN)
        .args(["run", "--code", "result = x + 1;", "--input", r#"{"x": 41}"#])
        .output()
        .expect("run scriptbox");
    assert!(output.status.success());

    let result: ExecutionResult = serde_json::from_slice(&output.stdout).unwrap();
    assert!(result.ok);
    assert_eq!(result.result, json!(42));
}

#[test]
fn test_cli_run_failure_exits_nonzero() {
    let output = Command::new(BIN)
        .args(["run", "--code", "let = ;"])
        .output()
        .expect("run scriptbox");
    assert_eq!(output.status.code(), Some(1));

    let result: ExecutionResult = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
}

#[test]
fn test_cli_policy_file_and_array_input() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.json");
    std::fs::write(
        &policy_path,
        r#"{"allowed_imports": ["stats"], "allowed_builtins": ["len"]}"#,
    )
    .unwrap();
    let script_path = dir.path().join("script.rhai");
    std::fs::write(&script_path, r#"import "stats" as stats; result = stats::mean(rows);"#).unwrap();

    let output = Command::new(BIN)
        .arg("run")
        .arg("--file")
        .arg(&script_path)
        .arg("--policy")
        .arg(&policy_path)
        .args(["--input", "[2, 4, 6]"])
        .output()
        .expect("run scriptbox");

    let result: ExecutionResult = serde_json::from_slice(&output.stdout).unwrap();
    assert!(result.ok, "{result:?}");
    assert_eq!(result.result, json!(4.0));
}

#[test]
fn test_cli_prints_default_policy() {
    let output = Command::new(BIN).arg("policy").output().expect("run scriptbox");
    assert!(output.status.success());

    let policy: Policy = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(policy, Policy::default());
}
