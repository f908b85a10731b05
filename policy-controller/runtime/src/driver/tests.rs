use super::*;
use gateway_policy_controller_core::{
    pass::{GatewayContext, ProxyTranslationPass, UnimplementedProxyTranslationPass},
    raw::RawPolicy,
    Plugin, PolicyKind, PolicyKindInfo, PolicyWrapper, POLICY_API_GROUP,
};
use gateway_policy_controller_index::PolicyRegistry;
use gateway_policy_controller_k8s_status::{Index, IndexMetrics, Update};
use gateway_policy_controller_translate::plugins::{self, PluginConfig};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

fn document(gateway: &str, synced: bool) -> String {
    format!(
        r#"
synced: {synced}
gateways:
  - metadata: {{name: {gateway}, namespace: default}}
    gatewayClassName: example
    listeners:
      - {{name: http, port: 8080, protocol: HTTP}}
httpRoutes:
  - metadata: {{name: example-route, namespace: default}}
    parentRefs:
      - name: {gateway}
    rules:
      - backendRefs:
          - {{name: httpbin, port: 8000}}
backends:
  - metadata: {{name: httpbin, namespace: default}}
    port: 8000
policies:
  - apiVersion: policy.gateway.dev/v1alpha1
    kind: TrafficPolicy
    metadata: {{name: timeout, namespace: default, generation: 3}}
    spec:
      targetRefs:
        - {{group: gateway.networking.k8s.io, kind: HTTPRoute, name: example-route}}
      timeouts:
        request: 10s
"#
    )
}

fn snapshot(gateway: &str) -> Arc<Snapshot> {
    Arc::new(Snapshot::from_yaml(&document(gateway, true)).unwrap())
}

fn gateway(name: &str) -> ObjectSource {
    ObjectSource::new("gateway.networking.k8s.io", "Gateway", "default", name)
}

fn policy_key() -> PolicyKey {
    PolicyKey::from(&ObjectSource::new(
        "policy.gateway.dev",
        "TrafficPolicy",
        "default",
        "timeout",
    ))
}

struct Harness {
    driver: Driver,
    snapshots: watch::Sender<Arc<Snapshot>>,
    outputs: watch::Receiver<Arc<Outputs>>,
    updates: mpsc::Receiver<Update>,
}

fn harness(initial: Arc<Snapshot>, validator: Option<Arc<dyn Validator>>) -> Harness {
    let registry = plugins::registry(&PluginConfig::default()).unwrap();
    harness_with(registry, initial, validator)
}

fn harness_with(
    registry: PolicyRegistry,
    initial: Arc<Snapshot>,
    validator: Option<Arc<dyn Validator>>,
) -> Harness {
    let translator = GatewayTranslator::new(Arc::new(registry), Default::default());
    let (updates_tx, updates) = mpsc::channel(16);
    let status = Index::shared("test-controller", updates_tx, IndexMetrics::default());
    let (snapshots, snapshots_rx) = watch::channel(initial);
    let (driver, outputs) = Driver::new(
        translator,
        validator,
        status,
        snapshots_rx,
        DriverMetrics::default(),
    );
    Harness {
        driver,
        snapshots,
        outputs,
        updates,
    }
}

async fn complete(driver: &Driver, snapshot: Arc<Snapshot>) -> Cycle {
    run_cycle(
        driver.translator.clone(),
        driver.validator.clone(),
        snapshot,
        driver.metrics.clone(),
    )
    .await
    .expect("cycle must complete")
}

/// A policy kind that panics while building any policy, and while
/// translating once `translate` is set.
struct Crashing {
    info: PolicyKindInfo,
    translate: AtomicBool,
}

impl Crashing {
    fn registry() -> (PolicyRegistry, Arc<Self>) {
        let crashing = Arc::new(Self {
            info: PolicyKindInfo {
                kind: PolicyKind::new(POLICY_API_GROUP, "CrashPolicy"),
                version: "v1alpha1".to_string(),
                plural: "crashpolicies".to_string(),
            },
            translate: AtomicBool::new(false),
        });
        let mut registry = plugins::registry(&PluginConfig::default()).unwrap();
        registry.register(crashing.clone()).unwrap();
        (registry, crashing)
    }
}

impl Plugin for Crashing {
    fn kind_info(&self) -> &PolicyKindInfo {
        &self.info
    }

    fn build_policy(&self, _: &RawPolicy) -> anyhow::Result<PolicyWrapper> {
        panic!("policy build crashed");
    }

    fn new_translation_pass(&self, _: &GatewayContext) -> Box<dyn ProxyTranslationPass> {
        if self.translate.load(Ordering::SeqCst) {
            panic!("translation crashed");
        }
        Box::new(UnimplementedProxyTranslationPass)
    }
}

/// Rejects every configuration while `reject` is set.
#[derive(Default)]
struct Toggle {
    reject: AtomicBool,
}

#[async_trait::async_trait]
impl Validator for Toggle {
    async fn validate(&self, config: &str) -> Result<(), ValidationError> {
        serde_json::from_str::<serde_json::Value>(config).expect("config must be JSON");
        if self.reject.load(Ordering::SeqCst) {
            return Err(ValidationError::InvalidConfig("rejected".to_string()));
        }
        Ok(())
    }
}

/// Never finishes validating the first configuration it sees.
struct StallFirst {
    stalled: AtomicBool,
    calls: mpsc::UnboundedSender<()>,
}

#[async_trait::async_trait]
impl Validator for StallFirst {
    async fn validate(&self, _: &str) -> Result<(), ValidationError> {
        let _ = self.calls.send(());
        if !self.stalled.swap(true, Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Always fails to run.
struct Broken;

#[async_trait::async_trait]
impl Validator for Broken {
    async fn validate(&self, _: &str) -> Result<(), ValidationError> {
        Err(ValidationError::Invocation(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        )))
    }
}

#[tokio::test]
async fn cycle_publishes_outputs_and_statuses() {
    let snapshot = snapshot("example-gateway");
    let Harness {
        mut driver,
        outputs,
        mut updates,
        ..
    } = harness(snapshot.clone(), None);

    let cycle = complete(&driver, snapshot.clone()).await;
    driver.publish(&snapshot, cycle);

    let outputs = outputs.borrow().clone();
    assert_eq!(
        outputs.keys().cloned().collect::<Vec<_>>(),
        vec![gateway("example-gateway")]
    );
    let out = &outputs[&gateway("example-gateway")];
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    assert_eq!(out.clusters.len(), 1);

    let update = updates.try_recv().expect("status must be written");
    assert_eq!(update.key, policy_key());
    assert!(updates.try_recv().is_err());

    // Publishing the same result again writes nothing.
    let cycle = complete(&driver, snapshot.clone()).await;
    driver.publish(&snapshot, cycle);
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn rejected_configs_keep_the_last_valid_output() {
    let validator = Arc::new(Toggle::default());
    let snapshot = snapshot("example-gateway");
    let Harness {
        mut driver,
        outputs,
        ..
    } = harness(snapshot.clone(), Some(validator.clone()));

    let cycle = complete(&driver, snapshot.clone()).await;
    driver.publish(&snapshot, cycle);
    let first = outputs.borrow()[&gateway("example-gateway")].clone();

    validator.reject.store(true, Ordering::SeqCst);
    let cycle = complete(&driver, snapshot.clone()).await;
    assert!(!cycle.gateways[0].valid);
    driver.publish(&snapshot, cycle);
    assert!(Arc::ptr_eq(
        &first,
        &outputs.borrow()[&gateway("example-gateway")]
    ));
}

#[tokio::test]
async fn rejected_configs_without_history_are_withheld() {
    let validator = Arc::new(Toggle {
        reject: AtomicBool::new(true),
    });
    let snapshot = snapshot("example-gateway");
    let Harness {
        mut driver,
        outputs,
        ..
    } = harness(snapshot.clone(), Some(validator));

    let cycle = complete(&driver, snapshot.clone()).await;
    driver.publish(&snapshot, cycle);
    assert!(outputs.borrow().is_empty());
}

#[tokio::test]
async fn validator_failures_do_not_block_publishing() {
    let snapshot = snapshot("example-gateway");
    let Harness { driver, .. } = harness(snapshot.clone(), Some(Arc::new(Broken)));
    let cycle = complete(&driver, snapshot).await;
    assert!(cycle.gateways[0].valid);
}

#[tokio::test]
async fn waits_for_sync() {
    let unsynced = Arc::new(Snapshot::from_yaml(&document("example-gateway", false)).unwrap());
    let Harness {
        driver,
        snapshots,
        mut outputs,
        ..
    } = harness(unsynced, None);
    let task = tokio::spawn(driver.run());

    time::sleep(time::Duration::from_millis(50)).await;
    assert!(!outputs.has_changed().unwrap());

    snapshots.send_replace(snapshot("example-gateway"));
    time::timeout(time::Duration::from_secs(5), outputs.changed())
        .await
        .expect("outputs must be published")
        .unwrap();
    assert!(outputs
        .borrow_and_update()
        .contains_key(&gateway("example-gateway")));
    task.abort();
}

#[tokio::test]
async fn newer_snapshots_cancel_the_cycle() {
    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let validator = Arc::new(StallFirst {
        stalled: AtomicBool::new(false),
        calls: calls_tx,
    });
    let Harness {
        driver,
        snapshots,
        mut outputs,
        ..
    } = harness(snapshot("first-gateway"), Some(validator));
    let task = tokio::spawn(driver.run());

    // The first cycle is stuck validating.
    calls.recv().await.expect("validator must be called");
    snapshots.send_replace(snapshot("second-gateway"));

    time::timeout(time::Duration::from_secs(5), outputs.changed())
        .await
        .expect("outputs must be published")
        .unwrap();
    assert_eq!(
        outputs.borrow_and_update().keys().cloned().collect::<Vec<_>>(),
        vec![gateway("second-gateway")]
    );
    task.abort();
}

#[tokio::test]
async fn failed_translations_keep_the_last_output() {
    let (registry, crashing) = Crashing::registry();
    let snapshot = snapshot("example-gateway");
    let Harness {
        mut driver,
        outputs,
        ..
    } = harness_with(registry, snapshot.clone(), None);

    let cycle = complete(&driver, snapshot.clone()).await;
    driver.publish(&snapshot, cycle);
    let first = outputs.borrow()[&gateway("example-gateway")].clone();

    crashing.translate.store(true, Ordering::SeqCst);
    let cycle = complete(&driver, snapshot.clone()).await;
    assert!(cycle.gateways.is_empty());
    assert_eq!(cycle.failed, vec![gateway("example-gateway")]);
    driver.publish(&snapshot, cycle);
    assert!(Arc::ptr_eq(
        &first,
        &outputs.borrow()[&gateway("example-gateway")]
    ));
}

#[tokio::test]
async fn failed_resolution_publishes_nothing() {
    let (registry, _) = Crashing::registry();
    let Harness {
        driver,
        snapshots,
        mut outputs,
        mut updates,
    } = harness_with(registry, snapshot("example-gateway"), None);
    let task = tokio::spawn(driver.run());

    time::timeout(time::Duration::from_secs(5), outputs.changed())
        .await
        .expect("outputs must be published")
        .unwrap();
    let update = updates.recv().await.expect("status must be written");
    assert_eq!(update.key, policy_key());

    let doc = format!(
        "{}{}",
        document("example-gateway", true),
        r#"
  - apiVersion: policy.gateway.dev/v1alpha1
    kind: CrashPolicy
    metadata: {name: crash, namespace: default}
"#
    );
    snapshots.send_replace(Arc::new(Snapshot::from_yaml(&doc).unwrap()));

    time::sleep(time::Duration::from_millis(100)).await;
    assert!(!outputs.has_changed().unwrap());
    assert!(outputs
        .borrow()
        .contains_key(&gateway("example-gateway")));
    assert!(updates.try_recv().is_err());
    task.abort();
}
