//! Mock verification harness for the assistant tool surface.
//!
//! Simulates every tool with fabricated responses; no network, no real
//! service. Phases run strictly sequentially; each case gets a bounded
//! retry budget with linear backoff; the run ends with two report
//! artifacts (machine JSON and a human-readable summary).

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use magicapi_core::error::codes;
use magicapi_mcp_runtime::{ToolError, ToolId};

/// Attempts per case: one initial try plus two retries.
const RETRY_BUDGET: u32 = 3;
/// Independent dispatches issued together in the concurrent phase.
const CONCURRENT_CALLS: usize = 4;
/// Simulated service latency for proxy tools.
const MOCK_LATENCY: Duration = Duration::from_millis(5);

#[derive(Parser)]
#[command(
    name = "magicapi-harness",
    version,
    about = "Simulated tool-surface verification with fabricated responses"
)]
struct Cli {
    /// Backoff unit in milliseconds; retry k waits (k-1) × unit
    #[arg(long, default_value_t = 200)]
    backoff_ms: u64,

    /// Machine-readable report path
    #[arg(long, default_value = "harness-report.json")]
    report_json: String,

    /// Human-readable summary path
    #[arg(long, default_value = "harness-report.txt")]
    report_text: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let backoff_unit = Duration::from_millis(cli.backoff_ms);
    let report = run_all_phases(&MockDispatcher, backoff_unit).await;

    let json_artifact = serde_json::to_string_pretty(&report.to_json()).unwrap_or_default();
    let text_artifact = report.render_text();
    if let Err(err) = std::fs::write(&cli.report_json, &json_artifact) {
        tracing::error!(path = %cli.report_json, %err, "failed to write JSON report");
    }
    if let Err(err) = std::fs::write(&cli.report_text, &text_artifact) {
        tracing::error!(path = %cli.report_text, %err, "failed to write text report");
    }
    println!("{text_artifact}");

    std::process::exit(if report.summary.failed == 0 { 0 } else { 1 });
}

// ---- mock dispatcher ----

/// Stands in for the real tool surface. Responses are fabricated but keep
/// the declared result shapes; unknown names are rejected the same way the
/// runtime rejects them.
struct MockDispatcher;

impl MockDispatcher {
    async fn dispatch(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let Some(tool) = ToolId::from_name(name) else {
            return Err(ToolError::new(
                codes::NOT_IMPLEMENTED,
                format!("Unknown tool '{name}'"),
            ));
        };
        match tool {
            ToolId::Syntax => {
                let topic = required_string_arg(args, "topic")?;
                if topic != "db" && topic != "basic" {
                    return Err(ToolError::new(
                        codes::NOT_FOUND,
                        format!("No syntax topic named '{topic}'"),
                    ));
                }
                Ok(json!({
                    "topic": topic,
                    "title": "mock topic",
                    "summary": "fabricated syntax entry",
                    "sections": {
                        "parameter_placeholders": "bind values with #{ }, never ${ }"
                    },
                    "doc": "mock.md",
                }))
            }
            ToolId::Examples => {
                let kind = required_string_arg(args, "kind")?;
                Ok(json!({
                    "kind": kind,
                    "examples": [
                        { "kind": kind, "title": "mock example", "code": "return 1;", "notes": "" }
                    ],
                }))
            }
            ToolId::Docs => Ok(json!({
                "index": [ { "id": "language", "title": "mock docs", "topics": ["basic"] } ],
                "summary": "fabricated documentation overview",
            })),
            ToolId::BestPractices => Ok(json!({ "items": ["mock practice"] })),
            ToolId::Pitfalls => Ok(json!({ "items": ["mock pitfall"] })),
            ToolId::Workflow => {
                let task = required_string_arg(args, "task")?;
                let mut payload = json!({
                    "task": task,
                    "description": "fabricated workflow",
                    "steps": ["step one", "step two"],
                });
                if args.get("with_commands").and_then(Value::as_bool) == Some(true) {
                    payload["commands"] = json!(["magicapi_call {}"]);
                }
                Ok(payload)
            }
            ToolId::ResourceTree => {
                self.simulate_round_trip().await;
                let format = args
                    .get("format")
                    .and_then(Value::as_str)
                    .unwrap_or("tree")
                    .to_string();
                let kind = args
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("api")
                    .to_string();
                let mut payload = json!({
                    "format": format,
                    "kind": kind,
                    "filters_applied": { "search": Value::Null, "depth": Value::Null },
                });
                match format.as_str() {
                    "list" => payload["nodes"] = mock_rows(),
                    "csv" => payload["csv"] = json!(mock_csv()),
                    _ => payload["tree"] = json!({ "api": mock_tree_nodes() }),
                }
                Ok(payload)
            }
            ToolId::PathToId => {
                self.simulate_round_trip().await;
                let path = required_string_arg(args, "path")?;
                let matches = if path.contains("missing") {
                    json!([])
                } else {
                    json!([{ "id": "f1", "name": "create order", "method": "POST", "path": "/order/create", "score": 1.0 }])
                };
                Ok(json!({ "path": path, "matches": matches }))
            }
            ToolId::PathDetail => {
                self.simulate_round_trip().await;
                let path = required_string_arg(args, "path")?;
                Ok(json!({
                    "path": path,
                    "fuzzy": args.get("fuzzy").and_then(Value::as_bool).unwrap_or(false),
                    "results": [{
                        "meta": { "id": "f1", "name": "create order", "method": "POST", "path": "/order/create", "score": 1.0 },
                        "detail": { "id": "f1", "script": "return 1;" },
                    }],
                }))
            }
            ToolId::ApiDetail => {
                self.simulate_round_trip().await;
                let file_id = required_string_arg(args, "file_id")?;
                if file_id == "missing" {
                    return Err(ToolError::new(
                        codes::NOT_FOUND,
                        format!("No script file with id '{file_id}'"),
                    ));
                }
                Ok(json!({
                    "id": file_id,
                    "name": "create order",
                    "path": "/order/create",
                    "method": "POST",
                    "script": "return db.insert('insert into orders(id) values(#{body.id})');",
                    "meta_raw": { "id": file_id, "groupId": "g1" },
                }))
            }
            ToolId::Call => {
                self.simulate_round_trip().await;
                required_string_arg(args, "method")?;
                required_string_arg(args, "path")?;
                Ok(json!({
                    "status": 200,
                    "headers": { "content-type": "application/json" },
                    "body": { "ok": true },
                }))
            }
            ToolId::Meta => Ok(json!({
                "system_prompt": "mock assistant prompt",
                "environment": { "base_url": "http://127.0.0.1:10712", "auth_enabled": false },
            })),
        }
    }

    async fn simulate_round_trip(&self) {
        tokio::time::sleep(MOCK_LATENCY).await;
    }
}

fn mock_tree_nodes() -> Value {
    json!([{
        "id": "g1",
        "name": "order",
        "path": "/order",
        "children": [
            { "id": "f1", "name": "create order", "method": "POST", "path": "/order/create" }
        ]
    }])
}

fn mock_rows() -> Value {
    json!([
        { "id": "g1", "name": "order", "method": "", "path": "/order", "kind": "api", "depth": 1 },
        { "id": "f1", "name": "create order", "method": "POST", "path": "/order/create", "kind": "api", "depth": 2 }
    ])
}

fn mock_csv() -> String {
    "id,name,method,path,kind\ng1,order,,/order,api\nf1,create order,POST,/order/create,api".to_string()
}

fn required_string_arg(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    match args.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(_) => Err(ToolError::new(
            codes::VALIDATION_ERROR,
            format!("'{key}' must be a non-empty string"),
        )),
        None => Err(ToolError::new(
            codes::VALIDATION_ERROR,
            format!("Missing required field '{key}'"),
        )),
    }
}

// ---- case engine ----

type CaseFn = Box<dyn for<'a> Fn(&'a MockDispatcher) -> BoxFuture<'a, Result<(), String>> + Send + Sync>;

struct TestCase {
    name: &'static str,
    run: CaseFn,
}

struct Phase {
    name: &'static str,
    cases: Vec<TestCase>,
}

#[derive(Clone, Debug, Serialize)]
struct CaseReport {
    name: String,
    passed: bool,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
struct Summary {
    total: u32,
    passed: u32,
    failed: u32,
}

impl Summary {
    fn absorb(&mut self, case: &CaseReport) {
        self.total += 1;
        if case.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: Summary) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
    }
}

struct PhaseReport {
    name: String,
    tests: Vec<CaseReport>,
    summary: Summary,
}

struct TestReport {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    phases: Vec<PhaseReport>,
    summary: Summary,
}

impl TestReport {
    fn to_json(&self) -> Value {
        let mut phases = Map::new();
        for phase in &self.phases {
            phases.insert(
                phase.name.clone(),
                json!({ "tests": phase.tests, "summary": phase.summary }),
            );
        }
        json!({
            "start_time": self.start_time.to_rfc3339(),
            "end_time": self.end_time.to_rfc3339(),
            "phases": phases,
            "summary": self.summary,
        })
    }

    fn render_text(&self) -> String {
        let mut text = format!(
            "Magic-API assistant harness {} .. {}\n",
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339()
        );
        for phase in &self.phases {
            text.push_str(&format!(
                "phase {}: {}/{} passed\n",
                phase.name, phase.summary.passed, phase.summary.total
            ));
            for case in &phase.tests {
                if !case.passed {
                    let error = case.error.as_deref().unwrap_or("unknown error");
                    text.push_str(&format!(
                        "  FAILED {} after {} attempts: {}\n",
                        case.name, case.attempts, error
                    ));
                }
            }
        }
        text.push_str(&format!(
            "total: {} passed, {} failed\n",
            self.summary.passed, self.summary.failed
        ));
        text
    }
}

/// Wait before attempt `next_attempt` (2-based): linear in the attempt index.
fn backoff_delay(next_attempt: u32, unit: Duration) -> Duration {
    unit * next_attempt.saturating_sub(1)
}

/// pending → attempt 1..=RETRY_BUDGET → success | failure with last error.
async fn run_case(dispatcher: &MockDispatcher, case: &TestCase, backoff_unit: Duration) -> CaseReport {
    let mut last_error = None;
    for attempt in 1..=RETRY_BUDGET {
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt, backoff_unit)).await;
        }
        match (case.run)(dispatcher).await {
            Ok(()) => {
                return CaseReport {
                    name: case.name.to_string(),
                    passed: true,
                    attempts: attempt,
                    error: None,
                };
            }
            Err(error) => {
                tracing::debug!(case = case.name, attempt, %error, "attempt failed");
                last_error = Some(error);
            }
        }
    }
    CaseReport {
        name: case.name.to_string(),
        passed: false,
        attempts: RETRY_BUDGET,
        error: last_error,
    }
}

async fn run_all_phases(dispatcher: &MockDispatcher, backoff_unit: Duration) -> TestReport {
    let start_time = Utc::now();
    let mut phases = Vec::new();
    let mut summary = Summary::default();

    // Phases are strictly sequential, as are the cases within one.
    for phase in build_phases() {
        let mut tests = Vec::new();
        let mut phase_summary = Summary::default();
        for case in &phase.cases {
            let report = run_case(dispatcher, case, backoff_unit).await;
            phase_summary.absorb(&report);
            tests.push(report);
        }
        summary.merge(phase_summary);
        phases.push(PhaseReport {
            name: phase.name.to_string(),
            tests,
            summary: phase_summary,
        });
    }

    TestReport {
        start_time,
        end_time: Utc::now(),
        phases,
        summary,
    }
}

// ---- shape assertions ----

fn expect_keys(payload: &Value, keys: &[&str]) -> Result<(), String> {
    let Some(object) = payload.as_object() else {
        return Err(format!("expected an object, got {payload}"));
    };
    for key in keys {
        if !object.contains_key(*key) {
            return Err(format!("missing key '{key}' in {payload}"));
        }
    }
    Ok(())
}

fn expect_array_key(payload: &Value, key: &str) -> Result<(), String> {
    match payload.get(key) {
        Some(Value::Array(_)) => Ok(()),
        other => Err(format!("expected array at '{key}', got {other:?}")),
    }
}

fn shape_case(
    name: &'static str,
    tool: &'static str,
    args: Value,
    keys: &'static [&'static str],
) -> TestCase {
    TestCase {
        name,
        run: Box::new(move |dispatcher| {
            let args = args.as_object().cloned().unwrap_or_default();
            Box::pin(async move {
                let payload = dispatcher
                    .dispatch(tool, &args)
                    .await
                    .map_err(|err| format!("{}: {}", err.code, err.message))?;
                expect_keys(&payload, keys)
            })
        }),
    }
}

fn error_case(
    name: &'static str,
    tool: &'static str,
    args: Value,
    expected_code: &'static str,
) -> TestCase {
    TestCase {
        name,
        run: Box::new(move |dispatcher| {
            let args = args.as_object().cloned().unwrap_or_default();
            Box::pin(async move {
                match dispatcher.dispatch(tool, &args).await {
                    Ok(payload) => Err(format!("expected {expected_code}, got success {payload}")),
                    Err(err) if err.code == expected_code => Ok(()),
                    Err(err) => Err(format!("expected {expected_code}, got {}", err.code)),
                }
            })
        }),
    }
}

fn build_phases() -> Vec<Phase> {
    vec![
        Phase {
            name: "knowledge",
            cases: vec![
                shape_case(
                    "syntax db has sections",
                    "magicapi_syntax",
                    json!({ "topic": "db" }),
                    &["topic", "title", "summary", "sections", "doc"],
                ),
                shape_case(
                    "examples carry kind",
                    "magicapi_examples",
                    json!({ "kind": "db" }),
                    &["kind", "examples"],
                ),
                shape_case(
                    "docs expose index",
                    "magicapi_docs",
                    json!({}),
                    &["index"],
                ),
                TestCase {
                    name: "best practices and pitfalls are lists",
                    run: Box::new(|dispatcher| {
                        Box::pin(async move {
                            let practices = dispatcher
                                .dispatch("magicapi_best_practices", &Map::new())
                                .await
                                .map_err(|err| err.message.clone())?;
                            expect_array_key(&practices, "items")?;
                            let pitfalls = dispatcher
                                .dispatch("magicapi_pitfalls", &Map::new())
                                .await
                                .map_err(|err| err.message.clone())?;
                            expect_array_key(&pitfalls, "items")
                        })
                    }),
                },
                shape_case(
                    "workflow has steps",
                    "magicapi_workflow",
                    json!({ "task": "debug_api", "with_commands": true }),
                    &["task", "description", "steps", "commands"],
                ),
            ],
        },
        Phase {
            name: "resource",
            cases: vec![
                shape_case(
                    "resource tree nests under kind",
                    "magicapi_resource_tree",
                    json!({ "kind": "api", "format": "tree" }),
                    &["format", "kind", "tree", "filters_applied"],
                ),
                shape_case(
                    "resource csv is flat",
                    "magicapi_resource_tree",
                    json!({ "kind": "api", "format": "csv" }),
                    &["format", "kind", "csv", "filters_applied"],
                ),
                shape_case(
                    "path resolves to matches",
                    "magicapi_path_to_id",
                    json!({ "path": "/order/create" }),
                    &["path", "matches"],
                ),
                TestCase {
                    name: "unmatched path yields empty matches",
                    run: Box::new(|dispatcher| {
                        Box::pin(async move {
                            let args = json!({ "path": "/missing/path", "fuzzy": true })
                                .as_object()
                                .cloned()
                                .unwrap_or_default();
                            let payload = dispatcher
                                .dispatch("magicapi_path_to_id", &args)
                                .await
                                .map_err(|err| err.message.clone())?;
                            match payload["matches"].as_array() {
                                Some(matches) if matches.is_empty() => Ok(()),
                                other => Err(format!("expected empty matches, got {other:?}")),
                            }
                        })
                    }),
                },
                shape_case(
                    "path detail pairs meta with detail",
                    "magicapi_path_detail",
                    json!({ "path": "/order/create" }),
                    &["path", "fuzzy", "results"],
                ),
                shape_case(
                    "api detail exposes script",
                    "magicapi_api_detail",
                    json!({ "file_id": "f1" }),
                    &["id", "name", "path", "method", "script", "meta_raw"],
                ),
            ],
        },
        Phase {
            name: "service",
            cases: vec![
                shape_case(
                    "call returns status headers body",
                    "magicapi_call",
                    json!({ "method": "POST", "path": "/order/create", "data": { "id": 1 } }),
                    &["status", "headers", "body"],
                ),
                shape_case(
                    "meta returns prompt and environment",
                    "magicapi_meta",
                    json!({}),
                    &["system_prompt", "environment"],
                ),
            ],
        },
        Phase {
            name: "errors",
            cases: vec![
                error_case(
                    "missing topic is a validation error",
                    "magicapi_syntax",
                    json!({}),
                    codes::VALIDATION_ERROR,
                ),
                error_case(
                    "unknown topic is not found",
                    "magicapi_syntax",
                    json!({ "topic": "nope" }),
                    codes::NOT_FOUND,
                ),
                error_case(
                    "missing file id is not found",
                    "magicapi_api_detail",
                    json!({ "file_id": "missing" }),
                    codes::NOT_FOUND,
                ),
                error_case(
                    "unknown tool is not implemented",
                    "magicapi_nope",
                    json!({}),
                    codes::NOT_IMPLEMENTED,
                ),
            ],
        },
        Phase {
            name: "concurrent",
            cases: vec![TestCase {
                name: "independent calls awaited together",
                run: Box::new(|dispatcher| {
                    Box::pin(async move {
                        let calls = (0..CONCURRENT_CALLS).map(|index| {
                            let args = json!({
                                "method": "GET",
                                "path": format!("/order/detail/{index}"),
                            });
                            async move {
                                let args = args.as_object().cloned().unwrap_or_default();
                                dispatcher.dispatch("magicapi_call", &args).await
                            }
                        });
                        let results = join_all(calls).await;
                        for result in results {
                            let payload = result.map_err(|err| err.message.clone())?;
                            expect_keys(&payload, &["status", "headers", "body"])?;
                        }
                        Ok(())
                    })
                }),
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_case(
        counter: Arc<AtomicU32>,
        succeed_from_attempt: u32,
    ) -> TestCase {
        TestCase {
            name: "counting",
            run: Box::new(move |_dispatcher| {
                let counter = counter.clone();
                Box::pin(async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt >= succeed_from_attempt {
                        Ok(())
                    } else {
                        Err(format!("attempt {attempt} failed"))
                    }
                })
            }),
        }
    }

    #[test]
    fn backoff_is_linear_in_attempt_index() {
        let unit = Duration::from_millis(200);
        assert_eq!(backoff_delay(2, unit), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, unit), Duration::from_millis(400));
        assert_eq!(backoff_delay(1, unit), Duration::ZERO);
    }

    #[tokio::test]
    async fn always_failing_case_is_attempted_exactly_three_times() {
        let counter = Arc::new(AtomicU32::new(0));
        let case = counting_case(counter.clone(), u32::MAX);
        let report = run_case(&MockDispatcher, &case, Duration::ZERO).await;

        assert_eq!(counter.load(Ordering::SeqCst), RETRY_BUDGET);
        assert!(!report.passed);
        assert_eq!(report.attempts, RETRY_BUDGET);
        // The last error sticks to the failure record.
        assert_eq!(report.error.as_deref(), Some("attempt 3 failed"));
    }

    #[tokio::test]
    async fn flaky_case_recovers_on_second_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let case = counting_case(counter.clone(), 2);
        let report = run_case(&MockDispatcher, &case, Duration::ZERO).await;

        assert!(report.passed);
        assert_eq!(report.attempts, 2);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_not_implemented() {
        let err = MockDispatcher
            .dispatch("magicapi_nope", &Map::new())
            .await
            .expect_err("unknown tool must fail");
        assert_eq!(err.code, codes::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn every_known_tool_has_a_well_formed_mock_response() {
        for tool in ToolId::ALL {
            let args = match tool {
                ToolId::Syntax => json!({ "topic": "db" }),
                ToolId::Examples => json!({ "kind": "db" }),
                ToolId::Workflow => json!({ "task": "debug_api" }),
                ToolId::PathToId | ToolId::PathDetail => json!({ "path": "/order/create" }),
                ToolId::ApiDetail => json!({ "file_id": "f1" }),
                ToolId::Call => json!({ "method": "GET", "path": "/order/detail" }),
                _ => json!({}),
            };
            let args = args.as_object().cloned().unwrap_or_default();
            let payload = MockDispatcher
                .dispatch(tool.name(), &args)
                .await
                .unwrap_or_else(|err| panic!("{} failed: {}", tool.name(), err.message));
            assert!(payload.is_object(), "{} must return an object", tool.name());
        }
    }

    #[tokio::test]
    async fn full_run_produces_consistent_report() {
        let report = run_all_phases(&MockDispatcher, Duration::ZERO).await;

        assert_eq!(report.summary.failed, 0);
        assert_eq!(
            report.summary.total,
            report.phases.iter().map(|phase| phase.summary.total).sum::<u32>()
        );
        let phase_names: Vec<&str> = report.phases.iter().map(|phase| phase.name.as_str()).collect();
        assert_eq!(
            phase_names,
            vec!["knowledge", "resource", "service", "errors", "concurrent"]
        );

        let json = report.to_json();
        assert!(json["phases"]["knowledge"]["summary"]["total"].as_u64().is_some());
        let text = report.render_text();
        assert!(text.contains("total:"));
        assert!(!text.contains("FAILED"));
    }
}
