use crate::{
    ir::BackendObjectIr,
    pass::{GatewayContext, PassError, ProxyTranslationPass},
    proxy::Cluster,
    raw::RawPolicy,
    PolicyIr, PolicyKindInfo, PolicyWrapper, SharedPolicyIr,
};

/// The result of merging several policies of one kind on one target.
#[derive(Clone, Debug)]
pub struct MergedPolicy {
    pub policy: SharedPolicyIr,

    /// For each input policy, whether any of its configuration survived into
    /// the merged policy.
    pub contributed: Vec<bool>,
}

/// Everything the control plane knows about one policy kind.
pub trait Plugin: Send + Sync {
    fn kind_info(&self) -> &PolicyKindInfo;

    /// Parses a raw policy of this kind.
    ///
    /// Structural problems are recorded in the wrapper's `errors` rather than
    /// returned; an `Err` means the policy could not be wrapped at all.
    fn build_policy(&self, raw: &RawPolicy) -> anyhow::Result<PolicyWrapper>;

    /// Creates the pass that applies this kind's policies to one gateway.
    fn new_translation_pass(&self, ctx: &GatewayContext) -> Box<dyn ProxyTranslationPass>;

    /// Whether policies attached to a gateway or listener also apply to the
    /// routes beneath it.
    fn inherits(&self) -> bool {
        false
    }

    /// Whether policies of this kind attached to the same target are merged.
    /// When false, only the highest-priority policy applies.
    fn merges(&self) -> bool {
        false
    }

    /// Merges policies attached to the same target, given in ascending
    /// priority order so that later policies override earlier ones.
    ///
    /// Only called when [`Plugin::merges`] is true. Returning `None` falls
    /// back to attaching the highest-priority policy as is.
    fn merge_policies(&self, _policies: &[SharedPolicyIr]) -> Option<MergedPolicy> {
        None
    }

    /// Applies this kind's effective policy, if any, to a backend's cluster.
    fn process_backend(
        &self,
        _policy: Option<&dyn PolicyIr>,
        _backend: &BackendObjectIr,
        _out: &mut Cluster,
    ) -> Result<(), PassError> {
        Ok(())
    }
}
