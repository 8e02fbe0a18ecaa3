use petrel::compiler::expander::Expander;
use petrel::dsl::builder::NetBuilder;
use petrel::dsl::{JoinType, SplitType};
use petrel::error::EngineError;
use petrel::runtime::context::Context;
use petrel::runtime::engine::{Engine, EngineConfig};
use petrel::runtime::events::StateChange;
use petrel::runtime::id::SequentialIds;
use petrel::runtime::storage::{TaskState, WorkItemState, WorkflowState};
use petrel::runtime::workflow::Workflow;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

fn engine() -> Engine {
    Engine::new().with_id_generator(Arc::new(SequentialIds::new("wf")))
}

fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// start -> scan_goods -> pay (AND-split) -> {pack_goods, issue_receipt} -> check_goods (AND-join) -> end
fn register_checkout(engine: &Engine) {
    let net = NetBuilder::new("checkout")
        .atomic("scan_goods")
        .task("pay").split(SplitType::And).build()
        .atomic("pack_goods")
        .atomic("issue_receipt")
        .task("check_goods").join(JoinType::And).build()
        .consume("start", "scan_goods")
        .connect("scan_goods", "pay")
        .connect("pay", "pack_goods")
        .connect("pay", "issue_receipt")
        .connect("pack_goods", "check_goods")
        .connect("issue_receipt", "check_goods")
        .connect("check_goods", "end")
        .build();
    engine.register_definition(net).expect("checkout net should compile");
}

/// A routes to B when foo == "B", to C when foo == "C", to D otherwise.
fn register_router(engine: &Engine) {
    let net = NetBuilder::new("router")
        .task("A").split(SplitType::Xor).build()
        .atomic("B")
        .atomic("C")
        .atomic("D")
        .consume("start", "A")
        .connect_ordered("A", "B", 1, "foo == \"B\"")
        .connect_ordered("A", "C", 2, "foo == \"C\"")
        .connect_default("A", "D")
        .connect("B", "end")
        .connect("C", "end")
        .connect("D", "end")
        .build();
    engine.register_definition(net).expect("router net should compile");
}

async fn fire_and_complete(engine: &Engine, wf: &str, task: &str) {
    engine.fire_task(wf, task).await.unwrap_or_else(|e| panic!("fire {} failed: {}", task, e));
    engine.complete_task(wf, task).await.unwrap_or_else(|e| panic!("complete {} failed: {}", task, e));
}

#[tokio::test]
async fn test_and_split_and_join() {
    let engine = engine();
    register_checkout(&engine);

    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();
    assert_eq!(engine.marking(&wf, "start").await.unwrap(), 1);
    assert_eq!(engine.enabled_tasks(&wf).await.unwrap(), vec!["scan_goods".to_string()]);

    fire_and_complete(&engine, &wf, "scan_goods").await;
    fire_and_complete(&engine, &wf, "pay").await;

    let to_pack = Expander::implicit_condition_name("pay", "pack_goods");
    let to_receipt = Expander::implicit_condition_name("pay", "issue_receipt");
    assert_eq!(engine.marking(&wf, &to_pack).await.unwrap(), 1);
    assert_eq!(engine.marking(&wf, &to_receipt).await.unwrap(), 1);
    assert_eq!(engine.task_state(&wf, "pack_goods").await.unwrap(), TaskState::Enabled);
    assert_eq!(engine.task_state(&wf, "issue_receipt").await.unwrap(), TaskState::Enabled);

    fire_and_complete(&engine, &wf, "pack_goods").await;
    assert_eq!(engine.task_state(&wf, "check_goods").await.unwrap(), TaskState::Disabled);

    fire_and_complete(&engine, &wf, "issue_receipt").await;
    assert_eq!(engine.task_state(&wf, "check_goods").await.unwrap(), TaskState::Enabled);

    fire_and_complete(&engine, &wf, "check_goods").await;
    assert_eq!(engine.marking(&wf, "end").await.unwrap(), 1);
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);
}

#[tokio::test]
async fn test_xor_split_routes_by_variable() {
    for (foo, expected) in [("B", "B"), ("C", "C"), ("Z", "D")] {
        let engine = engine();
        register_router(&engine);

        let wf = engine.start_workflow("router", vars(json!({ "foo": foo }))).await.unwrap();
        fire_and_complete(&engine, &wf, "A").await;

        let enabled = engine.enabled_tasks(&wf).await.unwrap();
        assert_eq!(enabled, vec![expected.to_string()], "foo = {}", foo);
    }
}

#[tokio::test]
async fn test_xor_split_without_variable_takes_default() {
    let engine = engine();
    register_router(&engine);

    let wf = engine.start_workflow("router", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "A").await;
    assert_eq!(engine.enabled_tasks(&wf).await.unwrap(), vec!["D".to_string()]);
}

#[tokio::test]
async fn test_or_split_fans_out_to_matching_flows() {
    let engine = engine();
    let net = NetBuilder::new("notify")
        .task("choose").split(SplitType::Or).build()
        .atomic("email")
        .atomic("sms")
        .atomic("letter")
        .consume("start", "choose")
        .connect_if("choose", "email", "email")
        .connect_if("choose", "sms", "sms")
        .connect_default("choose", "letter")
        .connect("email", "end")
        .connect("sms", "end")
        .connect("letter", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine
        .start_workflow("notify", vars(json!({ "email": true, "sms": false })))
        .await
        .unwrap();
    fire_and_complete(&engine, &wf, "choose").await;

    let mut enabled = engine.enabled_tasks(&wf).await.unwrap();
    enabled.sort();
    assert_eq!(enabled, vec!["email".to_string(), "letter".to_string()]);
}

/// Two branches share a `mutex` condition; `finish_task` clears it on completion.
fn register_interleaved(engine: &Engine) {
    let net = NetBuilder::new("interleaved")
        .condition("a_ready")
        .condition("b_ready")
        .condition("a_done")
        .condition("b_done")
        .condition("mutex")
        .atomic("start_task")
        .atomic("task_a")
        .atomic("task_b")
        .atomic("finish_task")
        .consume("start", "start_task")
        .connect("start_task", "a_ready")
        .connect("start_task", "b_ready")
        .connect("start_task", "mutex")
        .consume("a_ready", "task_a")
        .consume("mutex", "task_a")
        .connect("task_a", "a_done")
        .connect("task_a", "mutex")
        .consume("b_ready", "task_b")
        .consume("mutex", "task_b")
        .connect("task_b", "b_done")
        .connect("task_b", "mutex")
        .consume("a_done", "finish_task")
        .consume("b_done", "finish_task")
        .connect("finish_task", "end")
        .cancel_region("finish_task", &[], &["mutex"])
        .build();
    engine.register_definition(net).expect("interleaved net should compile");
}

#[tokio::test]
async fn test_interleaved_routing_with_cancellation_region() {
    let engine = engine();
    register_interleaved(&engine);

    let wf = engine.start_workflow("interleaved", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "start_task").await;

    let mut enabled = engine.enabled_tasks(&wf).await.unwrap();
    enabled.sort();
    assert_eq!(enabled, vec!["task_a".to_string(), "task_b".to_string()]);

    // task_a holds the mutex, so task_b must wait
    engine.fire_task(&wf, "task_a").await.unwrap();
    assert_eq!(engine.marking(&wf, "mutex").await.unwrap(), 0);
    assert_eq!(engine.task_state(&wf, "task_b").await.unwrap(), TaskState::Disabled);

    engine.complete_task(&wf, "task_a").await.unwrap();
    assert_eq!(engine.task_state(&wf, "task_b").await.unwrap(), TaskState::Enabled);
    assert_eq!(engine.task_state(&wf, "finish_task").await.unwrap(), TaskState::Disabled);

    fire_and_complete(&engine, &wf, "task_b").await;
    assert_eq!(engine.task_state(&wf, "finish_task").await.unwrap(), TaskState::Enabled);
    assert_eq!(engine.marking(&wf, "mutex").await.unwrap(), 1);

    fire_and_complete(&engine, &wf, "finish_task").await;
    assert_eq!(engine.marking(&wf, "mutex").await.unwrap(), 0);
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);
}

#[tokio::test]
async fn test_cancellation_region_cancels_active_task() {
    let engine = engine();
    // A deadline races the work; whichever completes first cancels the other.
    let net = NetBuilder::new("race")
        .task("begin").split(SplitType::And).build()
        .atomic("work")
        .atomic("deadline")
        .task("close").join(JoinType::Xor).build()
        .consume("start", "begin")
        .connect("begin", "work")
        .connect("begin", "deadline")
        .connect("work", "close")
        .connect("deadline", "close")
        .connect("close", "end")
        .cancel_region("deadline", &["work"], &[])
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("race", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "begin").await;

    let item = engine.fire_task(&wf, "work").await.unwrap();
    fire_and_complete(&engine, &wf, "deadline").await;

    assert_eq!(engine.task_state(&wf, "work").await.unwrap(), TaskState::Cancelled);
    let items = engine.work_items(&wf, "work").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, item);
    assert_eq!(items[0].state, WorkItemState::Canceled);
    assert_eq!(engine.task_state(&wf, "close").await.unwrap(), TaskState::Enabled);
}

#[tokio::test]
async fn test_loop_back_bumps_generation() {
    let engine = engine();
    let net = NetBuilder::new("review-loop")
        .condition("redo")
        .task("draft").join(JoinType::Xor).build()
        .task("review").split(SplitType::Xor).build()
        .consume("start", "draft")
        .consume("redo", "draft")
        .connect("draft", "review")
        .connect_ordered("review", "redo", 1, "approved == false")
        .connect_default("review", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine
        .start_workflow("review-loop", vars(json!({ "approved": false })))
        .await
        .unwrap();

    fire_and_complete(&engine, &wf, "draft").await;
    fire_and_complete(&engine, &wf, "review").await;

    // rejected: back to draft
    assert_eq!(engine.task_state(&wf, "draft").await.unwrap(), TaskState::Enabled);
    fire_and_complete(&engine, &wf, "draft").await;

    let item = engine.fire_task(&wf, "review").await.unwrap();
    engine.start_work_item(&wf, &item).await.unwrap();
    engine
        .complete_work_item(&wf, &item, Some(json!({ "approved": true })))
        .await
        .unwrap();

    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);
    let items = engine.work_items(&wf, "draft").await.unwrap();
    let mut generations: Vec<u32> = items.iter().map(|i| i.generation).collect();
    generations.sort();
    assert_eq!(generations, vec![1, 2]);
    assert_eq!(engine.get_vars(&wf).await.unwrap().get("approved"), Some(&json!(true)));
}

#[tokio::test]
async fn test_task_reenabled_when_input_still_marked() {
    let engine = engine();
    // `split` and `side_task` each put a token on `queue`
    let net = NetBuilder::new("double")
        .condition("queue")
        .condition("side")
        .task("split").split(SplitType::And).build()
        .atomic("side_task")
        .atomic("handle")
        .consume("start", "split")
        .connect("split", "queue")
        .connect("split", "side")
        .consume("side", "side_task")
        .connect("side_task", "queue")
        .consume("queue", "handle")
        .connect("handle", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("double", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "split").await;
    fire_and_complete(&engine, &wf, "side_task").await;
    assert_eq!(engine.marking(&wf, "queue").await.unwrap(), 2);

    engine.fire_task(&wf, "handle").await.unwrap();
    assert_eq!(engine.marking(&wf, "queue").await.unwrap(), 1);

    let mut events = engine.subscribe();
    engine.complete_task(&wf, "handle").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(change) = events.try_recv() {
        seen.push(change);
    }
    assert!(seen.contains(&StateChange::TaskState {
        workflow_id: wf.clone(),
        task: "handle".to_string(),
        state: TaskState::Enabled,
        generation: 1,
    }));
    // end was reached, so the second round is withdrawn
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);
    assert_eq!(engine.task_state(&wf, "handle").await.unwrap(), TaskState::Disabled);
    assert_eq!(engine.marking(&wf, "queue").await.unwrap(), 1);
}

#[tokio::test]
async fn test_invalid_requests_surface_errors() {
    let engine = engine();
    register_checkout(&engine);
    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();

    let err = engine.fire_task(&wf, "pay").await.unwrap_err();
    assert!(err.is_invalid_transition(), "unexpected error: {}", err);

    let err = engine.fire_task(&wf, "no_such_task").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);

    let err = engine.complete_task(&wf, "scan_goods").await.unwrap_err();
    assert!(err.is_invalid_transition(), "unexpected error: {}", err);

    let err = engine.start_workflow("no_such_net", Map::new()).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);

    // a failed call leaves state untouched
    assert_eq!(engine.task_state(&wf, "scan_goods").await.unwrap(), TaskState::Enabled);
    assert_eq!(engine.marking(&wf, "start").await.unwrap(), 1);
}

#[tokio::test]
async fn test_cancel_workflow() {
    let engine = engine();
    register_checkout(&engine);
    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "scan_goods").await;
    engine.fire_task(&wf, "pay").await.unwrap();

    engine.cancel_workflow(&wf).await.unwrap();
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Canceled);
    assert_eq!(engine.task_state(&wf, "pay").await.unwrap(), TaskState::Cancelled);
    assert!(engine.enabled_tasks(&wf).await.unwrap().is_empty());

    let err = engine.complete_task(&wf, "pay").await.unwrap_err();
    assert!(err.is_invalid_transition());
    let err = engine.cancel_workflow(&wf).await.unwrap_err();
    assert!(err.is_invalid_transition());
}

#[tokio::test]
async fn test_work_item_lifecycle() {
    let engine = engine();
    register_checkout(&engine);
    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();

    let item = engine.fire_task(&wf, "scan_goods").await.unwrap();
    let err = engine.complete_work_item(&wf, &item, None).await.unwrap_err();
    assert!(err.is_invalid_transition(), "initialized items must be started first");

    engine.start_work_item(&wf, &item).await.unwrap();
    engine
        .complete_work_item(&wf, &item, Some(json!({ "items": 3 })))
        .await
        .unwrap();

    assert_eq!(engine.task_state(&wf, "scan_goods").await.unwrap(), TaskState::Completed);
    assert_eq!(engine.task_state(&wf, "pay").await.unwrap(), TaskState::Enabled);
    let record = &engine.work_items(&wf, "scan_goods").await.unwrap()[0];
    assert_eq!(record.state, WorkItemState::Completed);
    assert_eq!(record.payload, json!({ "items": 3 }));
    assert_eq!(engine.get_vars(&wf).await.unwrap().get("items"), Some(&json!(3)));

    // cancelling the only item of a firing cancels the task
    let item = engine.fire_task(&wf, "pay").await.unwrap();
    engine.cancel_work_item(&wf, &item).await.unwrap();
    assert_eq!(engine.task_state(&wf, "pay").await.unwrap(), TaskState::Cancelled);
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Running);
}

#[tokio::test]
async fn test_failed_work_item_fails_workflow() {
    let engine = engine();
    register_checkout(&engine);
    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();

    let item = engine.fire_task(&wf, "scan_goods").await.unwrap();
    engine.fail_work_item(&wf, &item, "scanner offline").await.unwrap();

    assert_eq!(engine.task_state(&wf, "scan_goods").await.unwrap(), TaskState::Failed);
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Failed);
}

#[tokio::test]
async fn test_activities_run_on_fire() {
    let engine = engine();
    let net = NetBuilder::new("pricing")
        .task("quote")
            .activity("assign")
            .param("expression", "total = price * 2")
            .build()
        .task("auto_route")
            .activity("auto_complete")
            .split(SplitType::Xor)
            .build()
        .atomic("premium")
        .atomic("standard")
        .consume("start", "quote")
        .connect("quote", "auto_route")
        .connect_ordered("auto_route", "premium", 1, "total > 100")
        .connect_default("auto_route", "standard")
        .connect("premium", "end")
        .connect("standard", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("pricing", vars(json!({ "price": 60 }))).await.unwrap();
    fire_and_complete(&engine, &wf, "quote").await;
    assert_eq!(engine.get_vars(&wf).await.unwrap().get("total"), Some(&json!(120)));

    // auto_complete finishes the task inside the same call
    engine.fire_task(&wf, "auto_route").await.unwrap();
    assert_eq!(engine.task_state(&wf, "auto_route").await.unwrap(), TaskState::Completed);
    assert_eq!(engine.enabled_tasks(&wf).await.unwrap(), vec!["premium".to_string()]);
}

#[tokio::test]
async fn test_activity_failure_fails_workflow() {
    let engine = engine();
    let net = NetBuilder::new("broken")
        .task("explode").activity("fail").param("reason", "boom").build()
        .consume("start", "explode")
        .connect("explode", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("broken", Map::new()).await.unwrap();
    let err = engine.fire_task(&wf, "explode").await.unwrap_err();
    assert!(err.to_string().contains("boom"), "unexpected error: {}", err);
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Failed);
}

#[tokio::test]
async fn test_unknown_activity_leaves_task_enabled() {
    let engine = engine();
    let net = NetBuilder::new("missing-activity")
        .task("call").activity("does_not_exist").build()
        .consume("start", "call")
        .connect("call", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("missing-activity", Map::new()).await.unwrap();
    let err = engine.fire_task(&wf, "call").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(engine.task_state(&wf, "call").await.unwrap(), TaskState::Enabled);
}

#[tokio::test]
async fn test_state_change_feed() {
    let engine = engine();
    register_checkout(&engine);
    let mut events = engine.subscribe();

    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "scan_goods").await;

    let mut seen = Vec::new();
    while let Ok(change) = events.try_recv() {
        assert_eq!(change.workflow_id(), wf);
        seen.push(change);
    }

    assert!(seen.contains(&StateChange::WorkflowState {
        workflow_id: wf.clone(),
        state: WorkflowState::Running,
    }));
    assert!(seen.contains(&StateChange::Marking {
        workflow_id: wf.clone(),
        condition: "start".to_string(),
        marking: 1,
    }));
    assert!(seen.contains(&StateChange::TaskState {
        workflow_id: wf.clone(),
        task: "scan_goods".to_string(),
        state: TaskState::Active,
        generation: 1,
    }));
    assert!(seen.contains(&StateChange::TaskState {
        workflow_id: wf.clone(),
        task: "pay".to_string(),
        state: TaskState::Enabled,
        generation: 0,
    }));
}

#[tokio::test]
async fn test_drain_limit() {
    let engine = engine().with_config(EngineConfig::default().with_drain_limit(1));
    let net = NetBuilder::new("chain")
        .task("first").activity("auto_complete").build()
        .consume("start", "first")
        .connect("first", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("chain", Map::new()).await.unwrap();
    let err = engine.fire_task(&wf, "first").await.unwrap_err();
    assert!(matches!(err, EngineError::DrainLimitExceeded(1)), "unexpected error: {}", err);
}

/// start -> a -> end
fn register_single(engine: &Engine) {
    let net = NetBuilder::new("one")
        .atomic("a")
        .consume("start", "a")
        .connect("a", "end")
        .build();
    engine.register_definition(net).expect("single-task net should compile");
}

#[tokio::test]
async fn test_xor_join_with_two_marked_inputs_is_disabled() {
    let engine = engine();
    let net = NetBuilder::new("double-xor")
        .condition("c1")
        .condition("c2")
        .task("fork").split(SplitType::And).build()
        .task("join").join(JoinType::Xor).build()
        .atomic("take_c2")
        .consume("start", "fork")
        .connect("fork", "c1")
        .connect("fork", "c2")
        .consume("c1", "join")
        .consume("c2", "join")
        .consume("c2", "take_c2")
        .connect("take_c2", "end")
        .connect("join", "end")
        .build();
    engine.register_definition(net).unwrap();

    let wf = engine.start_workflow("double-xor", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "fork").await;

    assert_eq!(engine.marking(&wf, "c1").await.unwrap(), 1);
    assert_eq!(engine.marking(&wf, "c2").await.unwrap(), 1);
    assert_eq!(engine.task_state(&wf, "join").await.unwrap(), TaskState::Disabled);
    let err = engine.fire_task(&wf, "join").await.unwrap_err();
    assert!(err.is_invalid_transition(), "unexpected error: {}", err);
    assert_eq!(engine.marking(&wf, "c1").await.unwrap(), 1);

    // once c2 is taken, exactly one input is marked again
    engine.fire_task(&wf, "take_c2").await.unwrap();
    assert_eq!(engine.task_state(&wf, "join").await.unwrap(), TaskState::Enabled);

    fire_and_complete(&engine, &wf, "join").await;
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);
}

#[tokio::test]
async fn test_enable_and_disable_are_idempotent() {
    let engine = engine();
    register_checkout(&engine);
    let wf = engine.start_workflow("checkout", Map::new()).await.unwrap();

    let (events, mut rx) = broadcast::channel(16);
    let net = engine.net_of(&wf).await.unwrap();
    let handle = Workflow::new(Context::new(wf.clone(), net, engine.store(), events, 10_000));

    let scan = handle.task("scan_goods").unwrap();
    let pay = handle.task("pay").unwrap();
    assert!(!scan.enable().await.unwrap());
    assert!(!pay.disable().await.unwrap());
    assert!(rx.try_recv().is_err());

    assert!(scan.disable().await.unwrap());
    assert!(!scan.disable().await.unwrap());
    assert!(scan.enable().await.unwrap());
    assert!(!scan.enable().await.unwrap());

    let mut changes = Vec::new();
    while let Ok(change) = rx.try_recv() {
        changes.push(change);
    }
    assert_eq!(changes.len(), 2);
    assert_eq!(engine.task_state(&wf, "scan_goods").await.unwrap(), TaskState::Enabled);
}

#[tokio::test]
async fn test_cancel_finished_workflow_writes_nothing() {
    let engine = engine();
    register_single(&engine);
    let wf = engine.start_workflow("one", Map::new()).await.unwrap();
    fire_and_complete(&engine, &wf, "a").await;
    assert_eq!(engine.workflow_state(&wf).await.unwrap(), WorkflowState::Completed);

    let before = engine.snapshot(&wf).await.unwrap();
    let err = engine.cancel_workflow(&wf).await.unwrap_err();
    assert!(err.is_invalid_transition(), "unexpected error: {}", err);

    assert_eq!(engine.marking(&wf, "end").await.unwrap(), 1);
    assert_eq!(engine.snapshot(&wf).await.unwrap(), before);
}

#[tokio::test]
async fn test_request_locks_released_when_root_finishes() {
    let engine = engine();
    register_single(&engine);

    let done = engine.start_workflow("one", Map::new()).await.unwrap();
    let cancelled = engine.start_workflow("one", Map::new()).await.unwrap();
    assert_eq!(engine.tracked_roots(), 2);

    fire_and_complete(&engine, &done, "a").await;
    assert_eq!(engine.tracked_roots(), 1);

    engine.cancel_workflow(&cancelled).await.unwrap();
    assert_eq!(engine.tracked_roots(), 0);

    // reads of a finished instance do not leave an entry behind
    engine.snapshot(&done).await.unwrap();
    assert_eq!(engine.tracked_roots(), 0);
}
