use ahash::AHashMap as HashMap;
use gateway_policy_controller_core::{
    raw::RawPolicy, Plugin, PolicyKind, PolicyKindInfo, PolicyWrapper,
};
use std::{fmt, sync::Arc};

/// The set of policy kinds the controller understands, built once at startup.
///
/// Plugins are visited in registration order wherever order matters, e.g.
/// when translation passes run.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    by_kind: HashMap<PolicyKind, usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("policy kind {0} is already registered")]
pub struct DuplicateKind(pub PolicyKind);

// === impl PolicyRegistry ===

impl PolicyRegistry {
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), DuplicateKind> {
        let kind = plugin.kind_info().kind.clone();
        if self.by_kind.contains_key(&kind) {
            return Err(DuplicateKind(kind));
        }
        self.by_kind.insert(kind, self.plugins.len());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn plugin(&self, kind: &PolicyKind) -> Option<&dyn Plugin> {
        self.by_kind.get(kind).map(|&i| &*self.plugins[i])
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &PolicyKindInfo> {
        self.plugins.iter().map(|p| p.kind_info())
    }

    pub fn supports_merge(&self, kind: &PolicyKind) -> bool {
        self.plugin(kind).is_some_and(|p| p.merges())
    }

    pub fn inherits(&self, kind: &PolicyKind) -> bool {
        self.plugin(kind).is_some_and(|p| p.inherits())
    }

    /// Builds every policy of a registered kind. Policies of unknown kinds,
    /// and policies a plugin cannot wrap at all, are skipped.
    pub fn build_policies<'r>(
        &self,
        raw: impl IntoIterator<Item = &'r RawPolicy>,
    ) -> Vec<PolicyWrapper> {
        raw.into_iter()
            .filter_map(|raw| {
                let kind = PolicyKind::new(raw.group(), &raw.kind);
                let Some(plugin) = self.plugin(&kind) else {
                    tracing::debug!(%kind, ns = %raw.metadata.namespace, name = %raw.metadata.name, "Ignoring policy of unknown kind");
                    return None;
                };
                match plugin.build_policy(raw) {
                    Ok(policy) => Some(policy),
                    Err(error) => {
                        tracing::warn!(%kind, ns = %raw.metadata.namespace, name = %raw.metadata.name, %error, "Failed to build policy");
                        None
                    }
                }
            })
            .collect()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.kinds().map(|info| &info.kind))
            .finish()
    }
}
