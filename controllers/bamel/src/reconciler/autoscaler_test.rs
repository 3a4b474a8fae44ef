use crate::backoff::ExponentialBackoff;
use crate::pool_index::PoolIndex;
use crate::scheduler::{ReconcileAction, WorkQueue};
use crate::test_utils::{Harness, node_in_state, test_config, test_policy};
use crds::{BamelAutoscaler, DesiredPowerState, NodeState, PoolCondition, ResourceAmounts};
use std::sync::Arc;
use std::time::Duration;

fn harness_with(nodes: &[(&str, NodeState, DesiredPowerState)], policy: BamelAutoscaler) -> Harness {
    let h = Harness::new();
    for (name, state, desired) in nodes {
        h.add_node(node_in_state(name, "gpu", *state, *desired));
        h.runtime.join(name, true);
    }
    h.store.insert_policy(policy);
    h
}

fn condition(h: &Harness, policy: &str) -> PoolCondition {
    h.store
        .policy(policy)
        .status
        .unwrap()
        .scaling_active()
        .cloned()
        .unwrap()
}

fn desired(h: &Harness, name: &str) -> DesiredPowerState {
    h.store.node(name).spec.power_state
}

const READY: (NodeState, DesiredPowerState) = (NodeState::Ready, DesiredPowerState::On);
const OFF: (NodeState, DesiredPowerState) = (NodeState::Off, DesiredPowerState::Off);

#[tokio::test]
async fn test_scale_out_powers_on_exactly_the_shortfall() {
    let h = harness_with(
        &[
            ("r1", READY.0, READY.1),
            ("r2", READY.0, READY.1),
            ("r3", READY.0, READY.1),
            ("p1", NodeState::PoweringOn, DesiredPowerState::On),
            ("o1", OFF.0, OFF.1),
            ("o2", OFF.0, OFF.1),
        ],
        test_policy("gpu-autoscaler", "gpu", 5),
    );

    let action = h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(action, ReconcileAction::Requeue(test_config().autoscaler_interval));
    assert_eq!(desired(&h, "o1"), DesiredPowerState::On);
    assert_eq!(desired(&h, "o2"), DesiredPowerState::Off);
    assert_eq!(h.store.spec_writes(), 1);
    assert_eq!(h.index.entry("o1").unwrap().desired, DesiredPowerState::On);

    let status = h.store.policy("gpu-autoscaler").status.unwrap();
    assert_eq!(status.observed_ready, 3);
    assert_eq!(status.pending, 2);
    assert_eq!(status.desired_ready, 5);
    assert!(status.last_scale_time.is_some());
    assert_eq!(status.last_decision.as_deref(), Some("scale-out 1: o1"));
    assert_eq!(condition(&h, "gpu-autoscaler").status, "True");

    let decisions = h.metrics.scaling_decisions.with_label_values(&["gpu", "scale-out"]).get();
    assert_eq!(decisions, 1);
}

#[tokio::test]
async fn test_commanded_nodes_are_not_commanded_twice() {
    let h = harness_with(
        &[("r1", READY.0, READY.1), ("o1", OFF.0, OFF.1), ("o2", OFF.0, OFF.1)],
        test_policy("gpu-autoscaler", "gpu", 2),
    );

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.spec_writes(), 1);
    assert_eq!(desired(&h, "o2"), DesiredPowerState::Off);
}

#[tokio::test]
async fn test_index_updates_from_own_patches_respect_power_on_cap() {
    let queue = Arc::new(WorkQueue::new(
        "pool",
        ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100)),
    ));
    let index = {
        let queue = queue.clone();
        Arc::new(PoolIndex::with_listener(move |pool| queue.add(pool.to_string())))
    };
    let h = Harness::with_index(test_config(), index);
    let nodes: Vec<String> = (0..10).map(|i| format!("o{i}")).collect();
    for name in &nodes {
        h.add_node(node_in_state(name, "gpu", OFF.0, OFF.1));
    }
    let mut policy = test_policy("gpu-autoscaler", "gpu", 10);
    policy.spec.max_concurrent_power_on = 2;
    h.store.insert_policy(policy);

    // Every patch re-queues the pool through the index, as in the controller.
    let mut passes = 0;
    while !queue.is_empty() {
        assert!(passes < 10, "pool keeps re-queueing itself");
        let pool = queue.next().await.unwrap();
        h.reconciler.reconcile_pool(&pool).await.unwrap();
        queue.done(&pool);
        passes += 1;
    }

    let commanded = nodes.iter().filter(|n| desired(&h, n) == DesiredPowerState::On).count();
    assert_eq!(commanded, 2);
    assert_eq!(h.store.spec_writes(), 2);
}

#[tokio::test]
async fn test_surplus_within_margin_is_left_alone() {
    let nodes: Vec<String> = (1..=6).map(|i| format!("r{i}")).collect();
    let mut policy = test_policy("gpu-autoscaler", "gpu", 5);
    policy.spec.hysteresis_margin = 2;
    let h = Harness::new();
    for name in &nodes {
        h.add_node(node_in_state(name, "gpu", READY.0, READY.1));
    }
    h.store.insert_policy(policy);

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.spec_writes(), 0);
    assert!(nodes.iter().all(|n| desired(&h, n) == DesiredPowerState::On));
}

#[tokio::test]
async fn test_scale_in_then_node_drains() {
    let h = harness_with(
        &[("r1", READY.0, READY.1), ("r2", READY.0, READY.1), ("r3", READY.0, READY.1)],
        test_policy("gpu-autoscaler", "gpu", 1),
    );

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(desired(&h, "r1"), DesiredPowerState::Off);
    assert_eq!(h.store.spec_writes(), 1, "one drain per step");

    h.reconciler.reconcile_node("r1").await.unwrap();
    assert_eq!(h.store.node("r1").state(), NodeState::Draining);
    assert_eq!(h.runtime.cordoned(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_duplicate_policy_is_flagged() {
    let h = harness_with(&[("o1", OFF.0, OFF.1)], test_policy("a-autoscaler", "gpu", 1));
    h.store.insert_policy(test_policy("b-autoscaler", "gpu", 3));

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    let duplicate = condition(&h, "b-autoscaler");
    assert_eq!(duplicate.status, "False");
    assert_eq!(duplicate.reason, "DuplicatePool");
    assert!(duplicate.message.contains("a-autoscaler"));
    assert_eq!(condition(&h, "a-autoscaler").status, "True");
    assert_eq!(h.store.spec_writes(), 1, "only the owner's target applies");
}

#[tokio::test]
async fn test_suspended_policy_takes_no_action() {
    let mut policy = test_policy("gpu-autoscaler", "gpu", 3);
    policy.spec.suspended = true;
    let h = harness_with(&[("o1", OFF.0, OFF.1)], policy);

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.spec_writes(), 0);
    let condition = condition(&h, "gpu-autoscaler");
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "Suspended");
}

#[tokio::test]
async fn test_invalid_policy_is_reported() {
    let mut policy = test_policy("gpu-autoscaler", "gpu", 5);
    policy.spec.max_nodes = Some(2);
    let h = harness_with(&[("o1", OFF.0, OFF.1)], policy);

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.spec_writes(), 0);
    let condition = condition(&h, "gpu-autoscaler");
    assert_eq!(condition.reason, "InvalidPolicy");
    assert!(condition.message.contains("maxNodes"));
}

#[tokio::test]
async fn test_utilization_lookup_failure_suspends_pool() {
    let mut policy = test_policy("gpu-autoscaler", "gpu", 1);
    policy.spec.target_cpu_utilization_percent = Some(70);
    let h = harness_with(&[("r1", READY.0, READY.1), ("o1", OFF.0, OFF.1)], policy);
    h.runtime.set_failing(true);

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.spec_writes(), 0);
    assert_eq!(condition(&h, "gpu-autoscaler").reason, "UtilizationUnavailable");
}

#[tokio::test]
async fn test_conflicting_candidate_waits_for_next_pass() {
    let h = harness_with(&[("o1", OFF.0, OFF.1)], test_policy("gpu-autoscaler", "gpu", 1));
    h.store.conflict_next("o1");

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    assert_eq!(desired(&h, "o1"), DesiredPowerState::Off);
    assert_eq!(h.store.policy("gpu-autoscaler").status.unwrap().last_decision, None);

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    assert_eq!(desired(&h, "o1"), DesiredPowerState::On);
}

#[tokio::test]
async fn test_recovering_errored_node_requests_reset() {
    let mut policy = test_policy("gpu-autoscaler", "gpu", 1);
    policy.spec.recover_errored_nodes = true;
    let h = harness_with(&[("e1", NodeState::Error, DesiredPowerState::Off)], policy);

    h.reconciler.reconcile_pool("gpu").await.unwrap();

    let node = h.store.node("e1");
    assert_eq!(node.spec.power_state, DesiredPowerState::On);
    assert!(node.reset_requested_at().is_some());
    assert!(h.index.entry("e1").unwrap().is_pending());

    h.reconciler.reconcile_node("e1").await.unwrap();
    assert_eq!(h.store.node("e1").state(), NodeState::Off);
    h.reconciler.reconcile_node("e1").await.unwrap();
    assert_eq!(h.store.node("e1").state(), NodeState::PoweringOn);
}

#[tokio::test]
async fn test_cpu_pressure_scales_out_until_satisfied() {
    let mut policy = test_policy("gpu-autoscaler", "gpu", 1);
    policy.spec.target_cpu_utilization_percent = Some(50);
    let h = harness_with(&[("r1", READY.0, READY.1), ("o1", OFF.0, OFF.1), ("o2", OFF.0, OFF.1)], policy);
    h.runtime.set_allocated("r1", ResourceAmounts { cpu_millis: 24_000, memory_bytes: 0 });

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    assert_eq!(desired(&h, "o1"), DesiredPowerState::On);
    assert_eq!(h.store.policy("gpu-autoscaler").status.unwrap().desired_ready, 2);

    h.reconcile("o1").await;
    h.reconcile("o1").await;
    assert_eq!(h.state("o1"), NodeState::Ready);
    h.sync_index();

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    assert_eq!(h.store.spec_writes(), 1);
    assert_eq!(desired(&h, "o2"), DesiredPowerState::Off);
}

#[tokio::test]
async fn test_unchanged_status_is_not_rewritten() {
    let h = harness_with(&[("r1", READY.0, READY.1)], test_policy("gpu-autoscaler", "gpu", 1));

    h.reconciler.reconcile_pool("gpu").await.unwrap();
    h.reconciler.reconcile_pool("gpu").await.unwrap();

    assert_eq!(h.store.policy_status_writes(), 1);
}

#[tokio::test]
async fn test_pool_without_policy_is_done() {
    let h = Harness::new();
    h.add_node(node_in_state("o1", "batch", OFF.0, OFF.1));

    let action = h.reconciler.reconcile_pool("batch").await.unwrap();

    assert_eq!(action, ReconcileAction::Done);
    assert_eq!(h.store.spec_writes(), 0);
}
