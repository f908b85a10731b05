use crate::{
    metrics::DriverMetrics,
    snapshot::Snapshot,
    validator::{ValidationError, Validator},
};
use chrono::offset::Utc;
use gateway_policy_controller_core::{ObjectSource, PolicyKey};
use gateway_policy_controller_index::Resolver;
use gateway_policy_controller_k8s_api::PolicyStatus;
use gateway_policy_controller_k8s_status::{Reporter, SharedIndex};
use gateway_policy_controller_translate::{GatewayTranslator, ProxySnapshot};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{sync::watch, task::JoinSet, time};
use tracing::info_span;

/// The latest published proxy configuration of every gateway.
pub type Outputs = BTreeMap<ObjectSource, Arc<ProxySnapshot>>;

/// Runs a translation cycle for every snapshot, publishing validated proxy
/// configurations and policy statuses.
pub struct Driver {
    translator: GatewayTranslator,
    validator: Option<Arc<dyn Validator>>,
    status: SharedIndex,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    outputs: watch::Sender<Arc<Outputs>>,

    /// The status last observed on each policy object, so that an unchanged
    /// object does not reset the index's view of what we have written.
    observed: HashMap<PolicyKey, PolicyStatus>,
    metrics: DriverMetrics,
}

/// The result of a cycle that ran to completion.
#[derive(Debug)]
struct Cycle {
    reporter: Reporter,
    gateways: Vec<Checked>,

    /// Gateways whose translation task failed. Their last published
    /// configuration is kept.
    failed: Vec<ObjectSource>,
}

#[derive(Debug)]
struct Checked {
    snapshot: ProxySnapshot,
    valid: bool,
}

// === impl Driver ===

impl Driver {
    pub fn new(
        translator: GatewayTranslator,
        validator: Option<Arc<dyn Validator>>,
        status: SharedIndex,
        snapshots: watch::Receiver<Arc<Snapshot>>,
        metrics: DriverMetrics,
    ) -> (Self, watch::Receiver<Arc<Outputs>>) {
        let (outputs, rx) = watch::channel(Arc::default());
        let driver = Self {
            translator,
            validator,
            status,
            snapshots,
            outputs,
            observed: HashMap::new(),
            metrics,
        };
        (driver, rx)
    }

    pub async fn run(mut self) {
        loop {
            let snapshot = self.snapshots.borrow_and_update().clone();
            if snapshot.synced {
                let started = time::Instant::now();
                let cycle = run_cycle(
                    self.translator.clone(),
                    self.validator.clone(),
                    snapshot.clone(),
                    self.metrics.clone(),
                );
                tokio::select! {
                    biased;

                    changed = self.snapshots.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Snapshot source closed");
                            return;
                        }
                        self.metrics.cycle_cancelled();
                        tracing::debug!("Snapshot changed; abandoning translation cycle");
                        continue;
                    }

                    cycle = cycle => {
                        self.metrics.cycle_completed(started.elapsed());
                        match cycle {
                            Some(cycle) => self.publish(&snapshot, cycle),
                            None => tracing::warn!("Keeping the last published outputs and statuses"),
                        }
                    }
                }
            } else {
                tracing::debug!("Waiting for the snapshot source to sync");
            }

            if self.snapshots.changed().await.is_err() {
                tracing::debug!("Snapshot source closed");
                return;
            }
        }
    }

    fn publish(&mut self, snapshot: &Snapshot, cycle: Cycle) {
        let previous = self.outputs.borrow().clone();
        let mut outputs = Outputs::new();
        for Checked { snapshot, valid } in cycle.gateways {
            let gateway = snapshot.gateway.clone();
            self.metrics.diagnostics(
                &gateway.namespace,
                &gateway.name,
                snapshot.diagnostics.len(),
            );
            for diagnostic in &snapshot.diagnostics {
                tracing::info!(gateway = %gateway, %diagnostic, "Dropped proxy configuration");
            }

            if valid {
                outputs.insert(gateway, Arc::new(snapshot));
            } else if let Some(prior) = previous.get(&gateway) {
                tracing::warn!(gateway = %gateway, "Keeping the last valid proxy configuration");
                outputs.insert(gateway, prior.clone());
            }
        }
        for gateway in cycle.failed {
            if let Some(prior) = previous.get(&gateway) {
                outputs.insert(gateway, prior.clone());
            }
        }
        self.outputs.send_replace(Arc::new(outputs));

        let registry = self.translator.registry();
        let mut index = self.status.write();
        for raw in &snapshot.policies {
            let Some(status) = raw.status.as_ref() else {
                continue;
            };
            let key = PolicyKey::from(&raw.source());
            if registry.plugin(&key.kind()).is_none() {
                continue;
            }
            if self.observed.get(&key) != Some(status) {
                index.observe(key.clone(), status.clone());
                self.observed.insert(key, status.clone());
            }
        }
        self.observed.retain(|key, _| cycle.reporter.contains(key));

        let updates = index.apply(&cycle.reporter, Utc::now());
        tracing::debug!(updates, "Applied policy statuses");
    }
}

/// Logs each newly published set of proxy configurations.
pub async fn log_outputs(mut outputs: watch::Receiver<Arc<Outputs>>) {
    while outputs.changed().await.is_ok() {
        let outputs = outputs.borrow_and_update().clone();
        for (gateway, snapshot) in outputs.iter() {
            tracing::info!(
                %gateway,
                listeners = snapshot.listeners.len(),
                clusters = snapshot.clusters.len(),
                "Published proxy configuration"
            );
        }
    }
}

/// Resolves attachments, translates every gateway in parallel, and checks
/// each resulting configuration. Dropping the future abandons the cycle.
///
/// Returns `None` when attachments could not be resolved, in which case
/// nothing should be published.
async fn run_cycle(
    translator: GatewayTranslator,
    validator: Option<Arc<dyn Validator>>,
    snapshot: Arc<Snapshot>,
    metrics: DriverMetrics,
) -> Option<Cycle> {
    let resolve = {
        let translator = translator.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let registry = translator.registry();
            let policies = registry.build_policies(&snapshot.policies);
            let mut reporter = Reporter::default();
            let resolved = Resolver::new(registry, translator.inherited_policy_priority())
                .resolve(&snapshot.gateways, &policies, &mut reporter);
            (reporter, resolved)
        })
    };
    let (reporter, resolved) = match resolve.await {
        Ok(resolved) => resolved,
        Err(error) => {
            tracing::error!(%error, "Policy resolution failed");
            return None;
        }
    };

    let mut tasks = JoinSet::new();
    for gateway in &snapshot.gateways {
        let gateway = gateway.clone();
        let policies = resolved.get(&gateway.source).cloned().unwrap_or_default();
        let translator = translator.clone();
        tasks.spawn_blocking(move || {
            info_span!("translate", gateway = %gateway.source)
                .in_scope(|| translator.translate(&gateway, &policies))
        });
    }

    let mut translated = Vec::with_capacity(snapshot.gateways.len());
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(snapshot) => translated.push(snapshot),
            Err(error) => tracing::error!(%error, "Gateway translation failed"),
        }
    }
    translated.sort_by(|a, b| a.gateway.cmp(&b.gateway));
    let failed = snapshot
        .gateways
        .iter()
        .map(|gw| &gw.source)
        .filter(|source| !translated.iter().any(|s| &s.gateway == *source))
        .cloned()
        .collect::<Vec<_>>();

    let gateways = futures::future::join_all(
        translated
            .into_iter()
            .map(|snapshot| check(validator.as_deref(), snapshot, &metrics)),
    )
    .await;

    Some(Cycle {
        reporter,
        gateways,
        failed,
    })
}

/// Validates a gateway's configuration. Only a configuration the proxy
/// rejects is withheld; failing to run the validator publishes anyway.
async fn check(
    validator: Option<&dyn Validator>,
    snapshot: ProxySnapshot,
    metrics: &DriverMetrics,
) -> Checked {
    let Some(validator) = validator else {
        return Checked {
            snapshot,
            valid: true,
        };
    };

    let config = match snapshot
        .to_bootstrap()
        .and_then(|doc| serde_json::to_string(&doc))
    {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(gateway = %snapshot.gateway, %error, "Failed to render proxy configuration");
            metrics.validation_failed("render");
            return Checked {
                snapshot,
                valid: false,
            };
        }
    };

    let valid = match validator.validate(&config).await {
        Ok(()) => true,
        Err(error @ ValidationError::InvalidConfig(_)) => {
            tracing::warn!(gateway = %snapshot.gateway, %error, "Rejected proxy configuration");
            metrics.validation_failed(error.class());
            false
        }
        Err(error) => {
            tracing::error!(gateway = %snapshot.gateway, %error, "Publishing unvalidated proxy configuration");
            metrics.validation_failed(error.class());
            true
        }
    };
    Checked { snapshot, valid }
}

#[cfg(test)]
mod tests;
