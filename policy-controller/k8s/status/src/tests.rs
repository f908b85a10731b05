use crate::{gateway_ancestor, Index, IndexMetrics, Reporter, Update};
use chrono::{DateTime, Duration, Utc};
use gateway_policy_controller_core::{AttachmentReason, ObjectSource, PolicyError, PolicyKey};
use gateway_policy_controller_k8s_api::status::{
    conditions, messages, reasons, Condition, ParentReference, PolicyAncestorStatus, PolicyStatus,
};
use kube::api::Patch;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

const CONTROLLER: &str = "policy.gateway.dev/gateway-controller";

fn key(name: &str) -> PolicyKey {
    PolicyKey {
        group: "policy.gateway.dev".to_string(),
        kind: "TrafficPolicy".to_string(),
        namespace: "default".to_string(),
        name: name.to_string(),
    }
}

fn gateway(name: &str) -> ParentReference {
    gateway_ancestor(&ObjectSource::new(
        "gateway.networking.k8s.io",
        "Gateway",
        "default",
        name,
    ))
}

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: i64,
    at: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: Some(generation),
        last_transition_time: at,
    }
}

fn accepted(generation: i64, at: DateTime<Utc>) -> Condition {
    condition(
        conditions::ACCEPTED,
        conditions::STATUS_TRUE,
        reasons::VALID,
        messages::ACCEPTED,
        generation,
        at,
    )
}

fn ancestor(gw: &str, conditions: Vec<Condition>) -> PolicyAncestorStatus {
    PolicyAncestorStatus {
        ancestor_ref: gateway(gw),
        controller_name: CONTROLLER.to_string(),
        conditions,
    }
}

fn make_index() -> (Index, mpsc::Receiver<Update>) {
    let (tx, rx) = mpsc::channel(16);
    (Index::new(CONTROLLER, tx, IndexMetrics::default()), rx)
}

#[test]
fn merged_policy_status() {
    let mut reporter = Reporter::default();
    let mut policy = reporter.policy(key("tp"), 2);
    policy.attached(&gateway("example-gateway"), AttachmentReason::Merged);

    let status = reporter.render(&key("tp"), None, CONTROLLER, t0());
    assert_eq!(
        status,
        PolicyStatus {
            ancestors: vec![ancestor(
                "example-gateway",
                vec![
                    accepted(2, t0()),
                    condition(
                        conditions::ATTACHED,
                        conditions::STATUS_TRUE,
                        reasons::MERGED,
                        messages::MERGED,
                        2,
                        t0()
                    ),
                ]
            )],
        }
    );
}

#[test]
fn strongest_outcome_wins() {
    let mut reporter = Reporter::default();
    let gw = gateway("gw");
    let mut policy = reporter.policy(key("tp"), 1);
    policy.attached(&gw, AttachmentReason::Overridden);
    policy.attached(&gw, AttachmentReason::Attached);
    policy.attached(&gw, AttachmentReason::Merged);
    assert_eq!(
        reporter.attachment(&key("tp"), &gw),
        Some(AttachmentReason::Attached)
    );

    let status = reporter.render(&key("tp"), None, CONTROLLER, t0());
    assert_eq!(status.ancestors.len(), 1, "ancestors must not be duplicated");
    assert_eq!(status.ancestors[0].conditions[1].reason, reasons::ATTACHED);
}

#[test]
fn invalid_policy_is_not_attached() {
    let mut reporter = Reporter::default();
    let mut policy = reporter.policy(key("tp"), 4);
    policy.set_errors(&[
        PolicyError::new("invalid timeouts.request: missing a unit"),
        PolicyError::new("invalid rateLimit: maxTokens must be positive"),
    ]);
    policy.ancestor(&gateway("gw"));

    let status = reporter.render(&key("tp"), None, CONTROLLER, t0());
    assert_eq!(
        status.ancestors,
        vec![ancestor(
            "gw",
            vec![condition(
                conditions::ACCEPTED,
                conditions::STATUS_FALSE,
                reasons::INVALID,
                "invalid timeouts.request: missing a unit; invalid rateLimit: maxTokens must be positive",
                4,
                t0(),
            )]
        )]
    );
}

#[test]
fn overridden_policy_is_not_attached() {
    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Overridden);

    let status = reporter.render(&key("tp"), None, CONTROLLER, t0());
    let attached = status.ancestors[0]
        .condition(conditions::ATTACHED)
        .expect("must have an Attached condition");
    assert!(!attached.is_true());
    assert_eq!(attached.reason, reasons::OVERRIDDEN);
    assert_eq!(attached.message, messages::OVERRIDDEN);
}

#[test]
fn rendering_is_idempotent() {
    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);

    let first = reporter.render(&key("tp"), None, CONTROLLER, t0());
    let second = reporter.render(&key("tp"), Some(&first), CONTROLLER, t0() + Duration::hours(1));
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn transition_time_changes_with_status() {
    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);
    let first = reporter.render(&key("tp"), None, CONTROLLER, t0());

    let later = t0() + Duration::minutes(5);
    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 2)
        .attached(&gateway("gw"), AttachmentReason::Overridden);
    let second = reporter.render(&key("tp"), Some(&first), CONTROLLER, later);

    let conds = &second.ancestors[0].conditions;
    assert_eq!(conds[0], accepted(2, t0()));
    assert_eq!(conds[1].last_transition_time, later);
}

#[test]
fn stale_ancestors_are_pruned_and_foreign_ones_kept() {
    let foreign = PolicyAncestorStatus {
        ancestor_ref: gateway("other"),
        controller_name: "example.com/other-controller".to_string(),
        conditions: vec![accepted(1, t0())],
    };
    let previous = PolicyStatus {
        ancestors: vec![
            ancestor("old", vec![accepted(1, t0())]),
            foreign.clone(),
        ],
    };

    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("new"), AttachmentReason::Attached);
    let status = reporter.render(&key("tp"), Some(&previous), CONTROLLER, t0());

    let refs = status
        .ancestors
        .iter()
        .map(|a| a.ancestor_ref.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(refs, vec!["new", "other"]);
    assert_eq!(status.ancestors[1], foreign);
}

#[test]
fn index_sends_updates_only_on_change() {
    let (mut index, mut updates_rx) = make_index();

    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);

    assert_eq!(index.apply(&reporter, t0()), 1);
    let update = updates_rx.try_recv().unwrap();
    let expected = reporter.render(&key("tp"), None, CONTROLLER, t0());
    assert_eq!(update.key, key("tp"));
    assert_eq!(update.patch, Patch::Merge(expected.to_merge_patch()));
    assert!(updates_rx.try_recv().is_err());

    // Re-applying the same report is a no-op, even later.
    assert_eq!(index.apply(&reporter, t0() + Duration::hours(1)), 0);
    assert!(updates_rx.try_recv().is_err());
}

#[test]
fn index_prunes_removed_policies() {
    let (mut index, mut updates_rx) = make_index();

    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);
    index.apply(&reporter, t0());
    updates_rx.try_recv().unwrap();

    assert_eq!(index.apply(&Reporter::default(), t0()), 1);
    let update = updates_rx.try_recv().unwrap();
    assert_eq!(
        update.patch,
        Patch::Merge(PolicyStatus::default().to_merge_patch())
    );
    assert!(index.status(&key("tp")).is_none());

    assert_eq!(index.apply(&Reporter::default(), t0()), 0);
}

#[test]
fn index_respects_observed_status() {
    let (mut index, mut updates_rx) = make_index();

    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);
    let current = reporter.render(&key("tp"), None, CONTROLLER, t0());
    index.observe(key("tp"), current);

    assert_eq!(index.apply(&reporter, t0() + Duration::hours(1)), 0);
    assert!(updates_rx.try_recv().is_err());
}

#[test]
fn unattachable_policies_are_not_written() {
    let (mut index, mut updates_rx) = make_index();
    let mut reporter = Reporter::default();
    reporter.policy(key("lonely"), 1);
    assert_eq!(index.apply(&reporter, t0()), 0);
    assert!(updates_rx.try_recv().is_err());
}

#[test]
fn index_resends_updates_dropped_by_a_full_channel() {
    let (tx, mut updates_rx) = mpsc::channel(1);
    let mut index = Index::new(CONTROLLER, tx, IndexMetrics::default());

    let mut reporter = Reporter::default();
    for name in ["a", "b"] {
        reporter
            .policy(key(name), 1)
            .attached(&gateway("gw"), AttachmentReason::Attached);
    }

    assert_eq!(index.apply(&reporter, t0()), 1);
    assert_eq!(updates_rx.try_recv().unwrap().key, key("a"));
    assert!(index.status(&key("b")).is_none());

    assert_eq!(index.apply(&reporter, t0()), 1);
    assert_eq!(updates_rx.try_recv().unwrap().key, key("b"));
    assert_eq!(index.apply(&reporter, t0()), 0);
}

#[test]
fn index_retries_pruning_dropped_by_a_full_channel() {
    let (tx, mut updates_rx) = mpsc::channel(1);
    let mut index = Index::new(CONTROLLER, tx, IndexMetrics::default());

    let mut reporter = Reporter::default();
    reporter
        .policy(key("tp"), 1)
        .attached(&gateway("gw"), AttachmentReason::Attached);
    assert_eq!(index.apply(&reporter, t0()), 1);

    // The channel is still full, so the prune can't be sent.
    assert_eq!(index.apply(&Reporter::default(), t0()), 0);
    assert!(index.status(&key("tp")).is_some());

    updates_rx.try_recv().unwrap();
    assert_eq!(index.apply(&Reporter::default(), t0()), 1);
    assert!(index.status(&key("tp")).is_none());
}
