use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use apiflow::core::Severity;
use apiflow::{
    Context, EngineError, EvalError, FlowEngine, Marker, RunOutcome, Step, StepStatus,
    Substitution, Substitutor, TransportError,
};

use super::helpers::*;

fn request(id: &str) -> Value {
    json!({"id": id, "type": "request", "url": format!("/{}", id)})
}

#[tokio::test]
async fn test_sequential_requests_run_in_declared_order() {
    let transport = ScriptedTransport::new();
    let listener = RecordingListener::new();
    let engine = engine(transport.clone(), listener.clone());
    let flow = flow(json!({"id": "f1", "steps": [request("r1"), request("r2"), request("r3")]}));

    let outcome = engine.run(&flow).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.results.step_ids(), vec!["r1", "r2", "r3"]);
    assert!(snapshot.results.iter().all(|r| r.status == StepStatus::Success));
    assert_eq!(transport.urls(), vec!["/r1", "/r2", "/r3"]);
    assert_eq!(listener.flow_complete_count(), 1);
    assert_eq!(listener.flow_stopped_count(), 0);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_condition_runs_only_the_taken_branch() {
    let steps = json!([
        {
            "id": "c1", "type": "condition",
            "condition": {"variable": "x", "operator": "equals", "value": "1"},
            "thenSteps": [request("t1")],
            "elseSteps": [request("e1")]
        },
        request("r2")
    ]);

    for (x, expected) in [(json!(1), vec!["c1", "t1", "r2"]), (json!(2), vec!["c1", "e1", "r2"])] {
        let listener = RecordingListener::new();
        let engine = engine(ScriptedTransport::new(), listener.clone());
        let flow = flow(json!({"variables": {"x": x}, "steps": steps.clone()}));

        assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);
        assert_eq!(listener.started_ids(), expected);

        let results = engine.snapshot().await.results;
        let branch = results.iter().find_map(|r| r.marker.clone());
        let then_taken = expected[1] == "t1";
        let taken = if then_taken { "then" } else { "else" };
        assert_eq!(
            branch,
            Some(Marker::Branch {
                branch: taken.into(),
                steps: 1
            })
        );
        assert_eq!(results.get(0).unwrap().output, Some(json!({"result": then_taken, "branch": taken})));
    }
}

#[tokio::test]
async fn test_loop_binds_each_item_in_order() {
    let transport = ScriptedTransport::new();
    let listener = RecordingListener::new();
    let engine = engine(transport.clone(), listener.clone());
    let flow = flow(json!({
        "variables": {"arr": [1, 2, 3]},
        "steps": [{
            "id": "l1", "type": "loop", "source": "arr", "loopVariable": "item",
            "bodySteps": [{"id": "b1", "type": "request", "url": "/item/{{item}}"}]
        }]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);

    assert_eq!(transport.urls(), vec!["/item/1", "/item/2", "/item/3"]);
    let seen: Vec<Value> = listener
        .contexts_of("b1")
        .iter()
        .map(|ctx| ctx.get("item").cloned().unwrap_or(Value::Null))
        .collect();
    assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(
        listener.paths(),
        vec!["main", "main/loop:l1[0]", "main/loop:l1[1]", "main/loop:l1[2]"]
    );

    let results = engine.snapshot().await.results;
    assert_eq!(results.step_ids(), vec!["l1", "b1", "b1", "b1"]);
    let markers: Vec<Marker> = results.iter().filter_map(|r| r.marker.clone()).collect();
    assert_eq!(
        markers,
        vec![
            Marker::Iteration { index: 1, total: 3 },
            Marker::Iteration { index: 2, total: 3 },
            Marker::LoopEnd { iterations: 3 },
        ]
    );

    let final_context = listener
        .events()
        .into_iter()
        .find_map(|e| match e {
            Recorded::FlowComplete { context, .. } => Some(context),
            _ => None,
        })
        .unwrap();
    assert!(!final_context.contains("item"), "loop variable must not leak out of the loop");
}

#[tokio::test]
async fn test_empty_and_undefined_loop_sources_run_zero_times() {
    let body = json!([{"id": "b1", "type": "request", "url": "/b"}]);
    let listener = RecordingListener::new();
    let transport = ScriptedTransport::new();
    let engine = engine(transport.clone(), listener.clone());
    let flow = flow(json!({
        "variables": {"empty": [], "nothing": null},
        "steps": [
            {"id": "l1", "type": "loop", "source": "empty", "loopVariable": "i", "bodySteps": body.clone()},
            {"id": "l2", "type": "loop", "source": "nothing", "loopVariable": "i", "bodySteps": body.clone()},
            {"id": "l3", "type": "loop", "source": "missing", "loopVariable": "i", "bodySteps": body},
            request("after")
        ]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);
    assert_eq!(transport.urls(), vec!["/after"]);
    assert_eq!(listener.started_ids(), vec!["l1", "l2", "l3", "after"]);
    assert_eq!(listener.messages(Severity::Warning).len(), 2);
}

#[tokio::test]
async fn test_non_collection_loop_source_halts() {
    let listener = RecordingListener::new();
    let engine = engine(ScriptedTransport::new(), listener.clone());
    let flow = flow(json!({
        "variables": {"scalar": 5},
        "steps": [
            {"id": "l1", "type": "loop", "source": "scalar", "loopVariable": "i",
             "bodySteps": [request("b1")]},
            request("r2")
        ]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);
    assert_eq!(listener.started_ids(), vec!["l1"]);
    let results = engine.snapshot().await.results;
    assert_eq!(
        results.last().unwrap().error.as_deref(),
        Some("Loop source error: 'scalar' resolved to a number instead of an array")
    );
    assert_eq!(listener.flow_stopped_count(), 1);
}

#[tokio::test]
async fn test_condition_evaluation_error_halts() {
    let listener = RecordingListener::new();
    let engine = engine(ScriptedTransport::new(), listener.clone());
    let flow = flow(json!({
        "steps": [
            {"id": "c1", "type": "condition",
             "condition": {"variable": "x", "operator": "matches", "value": "a.*"},
             "thenSteps": [request("t1")]},
            request("r2")
        ]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);
    assert_eq!(listener.started_ids(), vec!["c1"]);
    assert!(listener.events().contains(&Recorded::Error {
        step_id: "c1".into(),
        error: "Condition evaluation failed: unknown operator 'matches'".into(),
    }));
}

#[tokio::test]
async fn test_transport_failure_with_stop_policy_halts() {
    let transport = ScriptedTransport::new().reply(
        "/r1",
        Reply::Fail(TransportError::Connect("refused".into())),
    );
    let listener = RecordingListener::new();
    let engine = engine(transport, listener.clone());
    let flow = flow(json!({"steps": [request("r1"), request("r2"), request("r3")]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);

    let results = engine.snapshot().await.results;
    assert_eq!(results.step_ids(), vec!["r1"]);
    let r1 = results.get(0).unwrap();
    assert_eq!(r1.status, StepStatus::Error);
    assert_eq!(r1.error.as_deref(), Some("Request failed: connection failed: refused"));
    assert_eq!(listener.started_ids(), vec!["r1"]);
    assert_eq!(listener.flow_stopped_count(), 1);
    assert_eq!(listener.flow_complete_count(), 0);
    let errors = listener.messages(Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Flow halted at step 'r1'"));
}

#[tokio::test]
async fn test_continue_policy_turns_404_into_success() {
    let transport = ScriptedTransport::new().reply("/r1", Reply::Json(404, json!({"error": "nope"})));
    let listener = RecordingListener::new();
    let engine = engine(transport, listener.clone());
    let flow = flow(json!({"steps": [
        {"id": "r1", "type": "request", "url": "/r1", "onFailure": "continue"},
        request("r2")
    ]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);

    let results = engine.snapshot().await.results;
    assert_eq!(results.step_ids(), vec!["r1", "r2"]);
    let r1 = results.get(0).unwrap();
    assert_eq!(r1.status, StepStatus::Success);
    assert_eq!(r1.output.as_ref().unwrap()["status"], json!(404));
    assert_eq!(r1.output.as_ref().unwrap()["body"], json!({"error": "nope"}));
    assert_eq!(listener.flow_complete_count(), 1);
}

#[tokio::test]
async fn test_continue_policy_records_transport_error_and_moves_on() {
    let transport = ScriptedTransport::new().reply(
        "/r1",
        Reply::Fail(TransportError::Request("reset by peer".into())),
    );
    let listener = RecordingListener::new();
    let engine = engine(transport, listener.clone());
    let flow = flow(json!({"steps": [
        {"id": "r1", "type": "request", "url": "/r1", "onFailure": "continue"},
        request("r2")
    ]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);
    let results = engine.snapshot().await.results;
    assert_eq!(results.get(0).unwrap().status, StepStatus::Error);
    assert_eq!(results.get(1).unwrap().status, StepStatus::Success);
    assert_eq!(listener.messages(Severity::Warning).len(), 1);
}

/// Hands back a condition step in place of whatever it was given.
struct KindSwapping;

impl Substitutor for KindSwapping {
    fn substitute(&self, step: &Step, _context: &Context) -> Result<Substitution, EvalError> {
        let swapped: Step = serde_json::from_value(json!({
            "id": step.id, "type": "condition",
            "condition": {"variable": "x", "operator": "equals", "value": 1}
        }))
        .map_err(|e| EvalError::new(e.to_string()))?;
        Ok(Substitution::unchanged(&swapped))
    }
}

#[tokio::test]
async fn test_internal_error_halts_even_under_continue_policy() {
    let transport = ScriptedTransport::new();
    let listener = RecordingListener::new();
    let engine = FlowEngine::builder(Arc::new(LooseEquals), Arc::new(DotPath))
        .substitutor(Arc::new(KindSwapping))
        .transport(transport.clone())
        .listener(listener.clone())
        .config(test_config())
        .build()
        .unwrap();
    let flow = flow(json!({"steps": [
        {"id": "r1", "type": "request", "url": "/r1", "onFailure": "continue"},
        request("r2")
    ]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.results.step_ids(), vec!["r1"]);
    let r1 = snapshot.results.get(0).unwrap();
    assert_eq!(r1.status, StepStatus::Error);
    assert!(r1.error.as_deref().unwrap().starts_with("Internal error: substitution turned request step"));
    assert_eq!(listener.started_ids(), vec!["r1"]);
    assert_eq!(listener.flow_stopped_count(), 1);
    assert_eq!(listener.flow_complete_count(), 0);
    assert!(listener.messages(Severity::Warning).is_empty());
    assert_eq!(listener.messages(Severity::Error).len(), 1);
    assert!(transport.urls().is_empty());
}

#[tokio::test]
async fn test_stop_aborts_in_flight_request() {
    let transport = ScriptedTransport::new().reply("/r1", Reply::Hang);
    let listener = RecordingListener::new();
    let engine = Arc::new(engine(transport.clone(), listener.clone()));
    let flow = flow(json!({"steps": [request("r1"), request("r2")]}));

    let handle = {
        let engine = engine.clone();
        let flow = flow.clone();
        tokio::spawn(async move { engine.run(&flow).await })
    };
    transport.started.notified().await;
    assert!(engine.is_running());
    engine.stop();

    let outcome = with_timeout("stopped run", Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);
    assert!(!engine.is_running());

    let snapshot = engine.snapshot().await;
    assert!(snapshot.stop_requested);
    assert_eq!(snapshot.results.step_ids(), vec!["r1"]);
    assert_eq!(
        snapshot.results.get(0).unwrap().error.as_deref(),
        Some("Request aborted by user")
    );
    assert_eq!(listener.started_ids(), vec!["r1"]);
    assert_eq!(listener.flow_stopped_count(), 1);
    assert_eq!(
        listener.messages(Severity::Error),
        vec!["Flow stopped by user during step 'r1'".to_string()]
    );
}

#[tokio::test]
async fn test_stop_interrupts_inter_step_delay() {
    let listener = RecordingListener::new();
    let engine = Arc::new(engine_with(
        ScriptedTransport::new(),
        listener.clone(),
        test_config().with_step_delay_ms(60_000),
    ));
    let flow = flow(json!({"steps": [request("r1"), request("r2")]}));

    let handle = {
        let engine = engine.clone();
        let flow = flow.clone();
        tokio::spawn(async move { engine.run(&flow).await })
    };
    listener.completed.notified().await;
    engine.stop();

    let outcome = with_timeout("delayed run", Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);
    assert_eq!(listener.started_ids(), vec!["r1"]);
}

#[tokio::test]
async fn test_request_timeout_is_reported() {
    let transport = ScriptedTransport::new().reply("/r1", Reply::Hang);
    let listener = RecordingListener::new();
    let config = test_config().with_request_timeout_ms(50);
    let engine = engine_with(transport, listener.clone(), config);
    let flow = flow(json!({"steps": [request("r1"), request("r2")]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);
    let results = engine.snapshot().await.results;
    assert_eq!(
        results.get(0).unwrap().error.as_deref(),
        Some("Request timed out after 50 ms")
    );
    assert_eq!(listener.started_ids(), vec!["r1"]);
}

#[tokio::test]
async fn test_extraction_feeds_later_steps_and_failures_are_recorded() {
    let transport = ScriptedTransport::new().reply(
        "/login",
        Reply::Json(200, json!({"token": "abc", "user": {"id": 7}})),
    );
    let listener = RecordingListener::new();
    let engine = engine(transport.clone(), listener.clone());
    let flow = flow(json!({
        "variables": {"missing": "stale"},
        "steps": [
            {"id": "login", "type": "request", "method": "POST", "url": "/login",
             "body": {"user": "ada"},
             "extract": {
                 "token": "body.token",
                 "uid": "user.id",
                 "code": ".status",
                 "missing": "body.nope"
             }},
            {"id": "me", "type": "request", "url": "/me",
             "headers": {"Authorization": "Bearer {{token}}"}}
        ]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);

    let requests = transport.requests();
    assert_eq!(requests[1].header("authorization"), Some("Bearer abc"));

    let results = engine.snapshot().await.results;
    let login = results.get(0).unwrap();
    assert_eq!(login.status, StepStatus::Success);
    assert_eq!(login.extraction_failures.len(), 1);
    assert_eq!(login.extraction_failures[0].var_name, "missing");
    assert_eq!(login.extraction_failures[0].path, "body.nope");

    let changes = listener.count(|e| matches!(e, Recorded::ContextChanged(_)));
    assert_eq!(changes, 1);

    let final_context = engine.snapshot().await.root_context;
    assert_eq!(final_context.get("token"), Some(&json!("abc")));
    assert_eq!(final_context.get("uid"), Some(&json!(7)));
    assert_eq!(final_context.get("code"), Some(&json!(200)));
    assert!(!final_context.contains("missing"));
}

#[tokio::test]
async fn test_branch_extraction_does_not_leak_to_parent() {
    let transport = ScriptedTransport::new().reply("/t1", Reply::Json(200, json!({"v": 1})));
    let listener = RecordingListener::new();
    let engine = engine(transport, listener.clone());
    let flow = flow(json!({
        "variables": {"x": "yes"},
        "steps": [
            {"id": "c1", "type": "condition",
             "condition": {"variable": "x", "operator": "equals", "value": "yes"},
             "thenSteps": [{"id": "t1", "type": "request", "url": "/t1", "extract": {"inner": "v"}}]},
            request("r2")
        ]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);
    assert_eq!(listener.contexts_of("t1")[0].get("inner"), Some(&json!(1)));
    assert!(!listener.contexts_of("r2")[0].contains("inner"));
}

#[tokio::test]
async fn test_unquoted_placeholders_become_json_literals() {
    let transport = ScriptedTransport::new();
    let engine = engine(transport.clone(), RecordingListener::new());
    let flow = flow(json!({
        "variables": {"n": 5, "flags": {"a": true}},
        "steps": [{"id": "r1", "type": "request", "method": "POST", "url": "/count",
                   "body": {"count": "{{n}}", "flags": "{{flags}}", "note": "n is {{n}}"}}]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);

    let sent = &transport.requests()[0];
    let body: Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({"count": 5, "flags": {"a": true}, "note": "n is 5"}));
    assert_eq!(sent.header("content-type"), Some("application/json"));
}

#[tokio::test]
async fn test_nested_loop_inside_branch_reports_paths() {
    let listener = RecordingListener::new();
    let engine = engine(ScriptedTransport::new(), listener.clone());
    let flow = flow(json!({
        "variables": {"x": 1, "arr": ["a", "b"]},
        "steps": [{
            "id": "c1", "type": "condition",
            "condition": {"variable": "x", "operator": "equals", "value": 1},
            "thenSteps": [{
                "id": "l1", "type": "loop", "source": "arr", "loopVariable": "item",
                "bodySteps": [request("b1")]
            }]
        }]
    }));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Completed);
    assert_eq!(
        listener.paths(),
        vec![
            "main",
            "main/then:c1",
            "main/then:c1/loop:l1[0]",
            "main/then:c1/loop:l1[1]",
        ]
    );
}

#[tokio::test]
async fn test_second_run_is_rejected_while_active() {
    let transport = ScriptedTransport::new().reply("/r1", Reply::Hang);
    let listener = RecordingListener::new();
    let engine = Arc::new(engine(transport.clone(), listener.clone()));
    let flow = flow(json!({"steps": [request("r1")]}));

    let handle = {
        let engine = engine.clone();
        let flow = flow.clone();
        tokio::spawn(async move { engine.run(&flow).await })
    };
    transport.started.notified().await;

    assert_eq!(
        engine.run(&flow).await.unwrap_err(),
        EngineError::AlreadyActive { active: "run" }
    );
    assert_eq!(engine.step(&flow).await, apiflow::StepOutcome::Rejected);
    assert_eq!(
        listener.messages(Severity::Warning),
        vec!["Engine is busy: a run is already in progress".to_string()]
    );

    engine.stop();
    with_timeout("rejected run", Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.urls(), vec!["/r1"]);
}

#[tokio::test]
async fn test_step_limit_halts_the_flow() {
    let listener = RecordingListener::new();
    let mut config = test_config();
    config.max_steps = 2;
    let engine = engine_with(ScriptedTransport::new(), listener.clone(), config);
    let flow = flow(json!({"steps": [request("r1"), request("r2"), request("r3")]}));

    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);
    assert_eq!(listener.started_ids(), vec!["r1", "r2"]);
    assert_eq!(
        listener.messages(Severity::Error),
        vec!["Flow halted: step limit of 2 reached".to_string()]
    );
}

#[tokio::test]
async fn test_reset_clears_state_after_a_halted_run() {
    let transport = ScriptedTransport::new().reply(
        "/r1",
        Reply::Fail(TransportError::Connect("refused".into())),
    );
    let engine = engine(transport, RecordingListener::new());
    let flow = flow(json!({"variables": {"a": 1}, "steps": [request("r1")]}));
    assert_eq!(engine.run(&flow).await.unwrap(), RunOutcome::Stopped);
    assert!(engine.snapshot().await.stop_requested);

    let vars: Context = [("b", json!(2))].into_iter().collect();
    engine.reset(vars.clone()).await;

    let snapshot = engine.snapshot().await;
    assert!(!snapshot.is_running);
    assert!(!snapshot.is_stepping);
    assert!(!snapshot.stop_requested);
    assert!(snapshot.results.is_empty());
    assert_eq!(snapshot.context, vars);
    assert_eq!(snapshot.root_context, vars);
    assert_eq!(snapshot.stack_depth, 0);
}

#[tokio::test]
async fn test_reset_during_run_stops_it_first() {
    let transport = ScriptedTransport::new().reply("/r1", Reply::Hang);
    let listener = RecordingListener::new();
    let engine = Arc::new(engine(transport.clone(), listener.clone()));
    let flow = flow(json!({"steps": [request("r1"), request("r2")]}));

    let handle = {
        let engine = engine.clone();
        let flow = flow.clone();
        tokio::spawn(async move { engine.run(&flow).await })
    };
    transport.started.notified().await;

    with_timeout("reset", Duration::from_secs(5), engine.reset(Context::new())).await;
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);

    let snapshot = engine.snapshot().await;
    assert!(!snapshot.is_running);
    assert!(!snapshot.stop_requested);
    assert!(snapshot.results.is_empty());
    assert_eq!(listener.flow_stopped_count(), 1);
}

#[tokio::test]
async fn test_empty_flow_completes_immediately() {
    let listener = RecordingListener::new();
    let engine = engine(ScriptedTransport::new(), listener.clone());

    assert_eq!(engine.run(&flow(json!({"steps": []}))).await.unwrap(), RunOutcome::Completed);
    assert!(listener.started_ids().is_empty());
    assert_eq!(listener.flow_complete_count(), 1);
}
