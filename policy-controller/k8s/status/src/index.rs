use crate::reporter::Reporter;
use ahash::AHashMap as HashMap;
use chrono::{offset::Utc, DateTime};
use gateway_policy_controller_core::{PolicyKey, PolicyKind, PolicyKindInfo};
use gateway_policy_controller_k8s_api::PolicyStatus;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use parking_lot::RwLock;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{collections::BTreeSet, sync::Arc};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Duration, MissedTickBehavior},
};

/// How long to wait before retrying patches that failed.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub type SharedIndex = Arc<RwLock<Index>>;

/// Tracks the status of every policy and emits an update whenever a newly
/// rendered status differs from the one on the object.
pub struct Index {
    controller_name: String,

    /// The status each policy is believed to have on the API server, either
    /// observed on the object or written by us.
    statuses: HashMap<PolicyKey, PolicyStatus>,
    updates: mpsc::Sender<Update>,
    metrics: IndexMetrics,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub key: PolicyKey,
    pub patch: Patch<serde_json::Value>,
}

/// Applies status updates to the API server.
pub struct Controller {
    client: kube::Client,
    resources: HashMap<PolicyKind, ApiResource>,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    patch_enqueued: Counter,
    patch_channel_full: Counter,
}

// === impl Index ===

impl Index {
    pub fn new(
        controller_name: impl ToString,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> Self {
        Self {
            controller_name: controller_name.to_string(),
            statuses: HashMap::new(),
            updates,
            metrics,
        }
    }

    pub fn shared(
        controller_name: impl ToString,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(controller_name, updates, metrics)))
    }

    /// Records the status currently on a policy object.
    pub fn observe(&mut self, key: PolicyKey, status: PolicyStatus) {
        self.statuses.insert(key, status);
    }

    pub fn status(&self, key: &PolicyKey) -> Option<&PolicyStatus> {
        self.statuses.get(key)
    }

    /// Renders the status of every reported or previously known policy and
    /// sends an update for each one that changed. Returns the number of
    /// updates sent.
    ///
    /// A status is only recorded once its update is enqueued, so an update
    /// that could not be sent is rendered again by the next call.
    pub fn apply(&mut self, reporter: &Reporter, now: DateTime<Utc>) -> usize {
        let keys = reporter
            .keys()
            .chain(self.statuses.keys())
            .cloned()
            .collect::<BTreeSet<_>>();

        let mut sent = 0;
        for key in keys {
            let previous = self.statuses.get(&key);
            let status = reporter.render(&key, previous, &self.controller_name, now);
            let unchanged = match previous {
                Some(previous) => *previous == status,
                None => status.ancestors.is_empty(),
            };

            if !unchanged {
                tracing::debug!(policy = %key, ancestors = status.ancestors.len(), "Status changed");
                if !self.send(key.clone(), &status) {
                    continue;
                }
                sent += 1;
            }

            if reporter.contains(&key) {
                self.statuses.insert(key, status);
            } else {
                // The policy is gone; forget it once our ancestors are pruned.
                self.statuses.remove(&key);
            }
        }
        sent
    }

    fn send(&self, key: PolicyKey, status: &PolicyStatus) -> bool {
        let patch = Patch::Merge(status.to_merge_patch());
        match self.updates.try_send(Update { key, patch }) {
            Ok(()) => {
                self.metrics.patch_enqueued.inc();
                true
            }
            Err(TrySendError::Full(Update { key, .. })) => {
                self.metrics.patch_channel_full.inc();
                tracing::error!(policy = %key, "Status update channel full; dropping update");
                false
            }
            Err(TrySendError::Closed(Update { key, .. })) => {
                tracing::error!(policy = %key, "Status update channel closed");
                false
            }
        }
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: kube::Client,
        kinds: impl IntoIterator<Item = PolicyKindInfo>,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        let resources = kinds
            .into_iter()
            .map(|info| {
                let resource = ApiResource {
                    group: info.kind.group.clone(),
                    version: info.version.clone(),
                    api_version: info.api_version(),
                    kind: info.kind.kind.clone(),
                    plural: info.plural.clone(),
                };
                (info.kind, resource)
            })
            .collect();
        Self {
            client,
            resources,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Applies updates as they arrive. Patches that fail are retried
    /// periodically until they succeed or a newer update for the same policy
    /// replaces them.
    pub async fn run(mut self) {
        let mut retries = Retries::default();
        let mut retry = time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                update = self.updates.recv() => {
                    let Some(update) = update else {
                        return;
                    };
                    retries.supersede(&update.key);
                    if let Err(update) = self.patch(update).await {
                        retries.push(update);
                    }
                }

                _ = retry.tick(), if !retries.is_empty() => {
                    for update in retries.drain() {
                        tracing::debug!(policy = %update.key, "Retrying status patch");
                        if let Err(update) = self.patch(update).await {
                            retries.push(update);
                        }
                    }
                }
            }
        }
    }

    /// Patches a policy's status, handing the update back if it should be
    /// retried.
    async fn patch(&self, update: Update) -> Result<(), Update> {
        let Some(resource) = self.resources.get(&update.key.kind()) else {
            tracing::warn!(policy = %update.key, "No API resource registered for policy kind");
            return Ok(());
        };
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            &update.key.namespace,
            resource,
        );

        let key = &update.key;
        let res = time::timeout(
            self.patch_timeout,
            api.patch_status(&key.name, &PatchParams::default(), &update.patch),
        )
        .await;
        match res {
            Ok(Ok(_)) => {
                self.metrics.patch_succeeded.inc();
                tracing::debug!(policy = %key, "Patched status");
                Ok(())
            }
            Ok(Err(error)) => {
                self.metrics.patch_failed.inc();
                tracing::error!(%key.namespace, %key.name, kind = %key.kind, %error, "Failed to patch policy status");
                if is_retryable(&error) {
                    Err(update)
                } else {
                    Ok(())
                }
            }
            Err(_) => {
                self.metrics.patch_timeout.inc();
                tracing::error!(%key.namespace, %key.name, kind = %key.kind, timeout = ?self.patch_timeout, "Timed out patching policy status");
                Err(update)
            }
        }
    }
}

/// A policy that no longer exists has no status to write.
fn is_retryable(error: &kube::Error) -> bool {
    !matches!(error, kube::Error::Api(response) if response.code == 404)
}

// === impl Retries ===

/// Failed patches awaiting another attempt, at most one per policy.
#[derive(Debug, Default)]
struct Retries(HashMap<PolicyKey, Patch<serde_json::Value>>);

impl Retries {
    fn push(&mut self, Update { key, patch }: Update) {
        self.0.insert(key, patch);
    }

    fn supersede(&mut self, key: &PolicyKey) {
        if self.0.remove(key).is_some() {
            tracing::debug!(policy = %key, "Pending retry replaced by a newer status");
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn drain(&mut self) -> Vec<Update> {
        let mut updates = self
            .0
            .drain()
            .map(|(key, patch)| Update { key, patch })
            .collect::<Vec<_>>();
        updates.sort_by(|a, b| a.key.cmp(&b.key));
        updates
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
        }
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_enqueued = Counter::default();
        prom.register(
            "patch_enqueued",
            "Count of status patches enqueued",
            patch_enqueued.clone(),
        );

        let patch_channel_full = Counter::default();
        prom.register(
            "patch_channel_full",
            "Count of status patches dropped because the channel was full",
            patch_channel_full.clone(),
        );

        Self {
            patch_enqueued,
            patch_channel_full,
        }
    }
}
