use petrel::compiler::core::Compiler;
use petrel::dsl::builder::NetBuilder;
use petrel::dsl::{JoinType, SplitType};
use petrel::error::EngineError;

fn expect_inconsistent(builder: NetBuilder, needle: &str) {
    let err = Compiler::new().compile(builder.build()).unwrap_err();
    match err {
        EngineError::NetConsistency(msg) => assert!(msg.contains(needle), "message `{}` lacks `{}`", msg, needle),
        other => panic!("expected NetConsistency, got {}", other),
    }
}

#[test]
fn test_compile_checkout_net() {
    let workflow = NetBuilder::new("checkout")
        .name("Checkout")
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

    let net = Compiler::new().compile(workflow).expect("Compilation failed");

    assert_eq!(net.id, "checkout");
    assert_eq!(net.name, "Checkout");
    assert_eq!(net.tasks.len(), 5);
    // start, end and five implicit conditions
    assert_eq!(net.conditions.len(), 7);
    assert_eq!(net.conditions.values().filter(|c| c.implicit).count(), 5);

    let pay = net.task("pay").unwrap();
    assert_eq!(pay.split_type, SplitType::And);
    assert_eq!(
        pay.postset().collect::<Vec<_>>(),
        vec!["implicit:pay->pack_goods", "implicit:pay->issue_receipt"]
    );
    assert_eq!(pay.preset, vec!["implicit:scan_goods->pay".to_string()]);

    let check = net.task("check_goods").unwrap();
    assert_eq!(check.preset.len(), 2);
    assert_eq!(net.condition("start").unwrap().postset, vec!["scan_goods".to_string()]);
    assert_eq!(net.condition("end").unwrap().preset, vec!["check_goods".to_string()]);
}

#[test]
fn test_xor_order() {
    let workflow = NetBuilder::new("ordering")
        .task("route").split(SplitType::Xor).build()
        .condition("a")
        .condition("b")
        .condition("c")
        .condition("d")
        .consume("start", "route")
        .connect_default("route", "a")
        .connect_if("route", "b", "x > 1")
        .connect_ordered("route", "c", 5, "x > 2")
        .connect_ordered("route", "d", 1, "x > 3")
        .build();

    let net = Compiler::new().compile(workflow).unwrap();
    let order: Vec<&str> = net
        .task("route")
        .unwrap()
        .xor_order()
        .into_iter()
        .map(|f| f.condition.as_str())
        .collect();
    assert_eq!(order, vec!["d", "c", "b", "a"]);
}

#[test]
fn test_reject_duplicate_task() {
    expect_inconsistent(
        NetBuilder::new("dup").atomic("a").atomic("a").consume("start", "a"),
        "duplicate task",
    );
}

#[test]
fn test_reject_name_clash() {
    expect_inconsistent(
        NetBuilder::new("clash").atomic("a").condition("a").consume("start", "a"),
        "both a task and a condition",
    );
}

#[test]
fn test_reject_missing_start_condition() {
    let mut definition = NetBuilder::new("no-start").atomic("a").consume("start", "a").build();
    definition.start_condition = "nowhere".to_string();
    let err = Compiler::new().compile(definition).unwrap_err();
    assert!(err.to_string().contains("start condition not declared"), "{}", err);
}

#[test]
fn test_reject_same_start_and_end() {
    let builder = NetBuilder::new("loop").end_condition("start").atomic("a").consume("start", "a");
    expect_inconsistent(builder, "must differ");
}

#[test]
fn test_reject_unknown_flow_target() {
    expect_inconsistent(
        NetBuilder::new("dangling").atomic("a").consume("start", "a").connect("a", "ghost"),
        "unknown target: ghost",
    );
    expect_inconsistent(
        NetBuilder::new("dangling").atomic("a").consume("start", "ghost"),
        "unknown task: ghost",
    );
}

#[test]
fn test_reject_duplicate_flow() {
    expect_inconsistent(
        NetBuilder::new("twice")
            .atomic("a")
            .consume("start", "a")
            .connect("a", "end")
            .connect("a", "end"),
        "duplicate flow",
    );
}

#[test]
fn test_reject_task_without_input() {
    expect_inconsistent(
        NetBuilder::new("orphan").atomic("a").atomic("b").consume("start", "a").connect("a", "end"),
        "no input condition: b",
    );
}

#[test]
fn test_reject_bad_predicate() {
    expect_inconsistent(
        NetBuilder::new("bad-predicate")
            .task("a").split(SplitType::Xor).build()
            .consume("start", "a")
            .connect_if("a", "end", "x == (1"),
        "invalid predicate",
    );
}

#[test]
fn test_reject_bad_cancellation_region() {
    expect_inconsistent(
        NetBuilder::new("bad-region")
            .atomic("a")
            .consume("start", "a")
            .connect("a", "end")
            .cancel_region("a", &["ghost"], &[]),
        "unknown task: ghost",
    );
    expect_inconsistent(
        NetBuilder::new("bad-region")
            .atomic("a")
            .consume("start", "a")
            .connect("a", "end")
            .cancel_region("a", &[], &["ghost"]),
        "unknown condition: ghost",
    );
    expect_inconsistent(
        NetBuilder::new("bad-region")
            .atomic("a")
            .consume("start", "a")
            .cancel_region("ghost", &[], &[]),
        "cancellation region on unknown task",
    );
}
