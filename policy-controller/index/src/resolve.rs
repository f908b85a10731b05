use crate::PolicyRegistry;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gateway_policy_controller_core::{
    ir::{BackendObjectIr, GatewayIr, HttpRouteIr, ListenerIr, RouteRuleIr},
    AttachmentReason, InheritedPolicyPriority, MergedPolicy, NotAttachable, ObjectSource,
    PolicyIr, PolicyKey, PolicyKind, PolicyWrapper, SharedPolicyIr,
};
use gateway_policy_controller_k8s_api::ParentReference;
use gateway_policy_controller_k8s_status::{gateway_ancestor, Reporter};
use std::{
    cmp::Ordering,
    collections::{hash_map::Entry, BTreeMap},
    sync::Arc,
};

/// Attaches policies to the objects they target, resolving conflicts between
/// policies of the same kind on the same target.
#[derive(Clone, Debug)]
pub struct Resolver<'r> {
    registry: &'r PolicyRegistry,
    inherited_priority: InheritedPolicyPriority,
}

/// The effective policy of each kind at one attachment point.
#[derive(Clone, Debug, Default)]
pub struct AttachedPolicies {
    policies: BTreeMap<PolicyKind, SharedPolicyIr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleId {
    pub listener: String,
    pub route: ObjectSource,
    pub rule: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteBackendId {
    pub rule: RuleId,
    pub backend: usize,
}

/// Every attachment resolved for one gateway. This is an immutable snapshot
/// shared with the gateway's translation.
#[derive(Clone, Debug, Default)]
pub struct GatewayPolicies {
    listeners: HashMap<String, AttachedPolicies>,
    rules: HashMap<RuleId, AttachedPolicies>,
    backends: HashMap<String, AttachedPolicies>,
    route_backends: HashMap<RouteBackendId, AttachedPolicies>,
}

// Attachment specificity, from least to most specific.
const RANK_GATEWAY: u8 = 0;
const RANK_LISTENER: u8 = 1;
const RANK_ROUTE: u8 = 2;
const RANK_RULE: u8 = 3;
const RANK_EXTENSION: u8 = 4;

static EMPTY: AttachedPolicies = AttachedPolicies {
    policies: BTreeMap::new(),
};

#[derive(Copy, Clone, Debug)]
struct Candidate<'p> {
    rank: u8,
    policy: &'p PolicyWrapper,
}

struct Evaluation<'a> {
    resolver: &'a Resolver<'a>,
    ancestor: ParentReference,
    reporter: &'a mut Reporter,
    reached: &'a mut HashSet<PolicyKey>,
}

// === impl Resolver ===

impl<'r> Resolver<'r> {
    pub fn new(registry: &'r PolicyRegistry, inherited_priority: InheritedPolicyPriority) -> Self {
        Self {
            registry,
            inherited_priority,
        }
    }

    /// Resolves the policies attached to each gateway and reports every
    /// policy's acceptance and attachment outcomes.
    pub fn resolve(
        &self,
        gateways: &[Arc<GatewayIr>],
        policies: &[PolicyWrapper],
        reporter: &mut Reporter,
    ) -> HashMap<ObjectSource, Arc<GatewayPolicies>> {
        for policy in policies {
            reporter
                .policy(policy.key(), policy.generation())
                .set_errors(&policy.errors);
        }

        let mut reached = HashSet::new();
        let mut resolved = HashMap::with_capacity(gateways.len());
        for gateway in gateways {
            let mut eval = Evaluation {
                resolver: self,
                ancestor: gateway_ancestor(&gateway.source),
                reporter: &mut *reporter,
                reached: &mut reached,
            };
            let attached = eval.gateway(gateway, policies);
            resolved.insert(gateway.source.clone(), Arc::new(attached));
        }

        for policy in policies {
            let key = policy.key();
            if !reached.contains(&key) {
                let error = NotAttachable { policy: key };
                tracing::warn!(policy = %error.policy, %error, "Policy targets nothing");
            }
        }

        resolved
    }

    /// Orders candidates of one kind from lowest to highest priority.
    fn ascending_priority(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        self.rank(a.rank)
            .cmp(&self.rank(b.rank))
            .then_with(|| a.policy.precedence_weight.cmp(&b.policy.precedence_weight))
            // Older policies take precedence.
            .then_with(|| b.policy.creation_time().cmp(&a.policy.creation_time()))
            // Then the lexicographically smaller key.
            .then_with(|| b.policy.key().cmp(&a.policy.key()))
    }

    fn rank(&self, rank: u8) -> u8 {
        match self.inherited_priority {
            InheritedPolicyPriority::PreferChild => rank,
            InheritedPolicyPriority::PreferParent => RANK_EXTENSION - rank,
        }
    }
}

// === impl Evaluation ===

impl Evaluation<'_> {
    fn gateway(&mut self, gateway: &GatewayIr, policies: &[PolicyWrapper]) -> GatewayPolicies {
        let mut out = GatewayPolicies::default();
        for listener in &gateway.listeners {
            let parents = policies
                .iter()
                .filter_map(|policy| {
                    let rank = listener_rank(policy, &gateway.source, listener)?;
                    Some(Candidate { rank, policy })
                })
                .collect::<Vec<_>>();
            let attached = self.evaluate(parents.clone());
            if !attached.policies.is_empty() {
                out.listeners.insert(listener.name.clone(), attached);
            }

            let inherited = parents
                .into_iter()
                .filter(|c| self.resolver.registry.inherits(&c.policy.kind()))
                .collect::<Vec<_>>();
            for route in &listener.routes {
                self.route(&mut out, listener, route, policies, &inherited);
            }
        }
        out
    }

    fn route<'p>(
        &mut self,
        out: &mut GatewayPolicies,
        listener: &ListenerIr,
        route: &HttpRouteIr,
        policies: &'p [PolicyWrapper],
        inherited: &[Candidate<'p>],
    ) {
        for (idx, rule) in route.rules.iter().enumerate() {
            let id = RuleId {
                listener: listener.name.clone(),
                route: route.source.clone(),
                rule: idx,
            };

            let candidates = policies
                .iter()
                .filter_map(|policy| {
                    let rank = rule_rank(policy, route, rule)?;
                    Some(Candidate { rank, policy })
                })
                .chain(inherited.iter().copied())
                .collect();
            let attached = self.evaluate(candidates);
            if !attached.policies.is_empty() {
                out.rules.insert(id.clone(), attached);
            }

            for (backend_idx, backend_ref) in rule.backends.iter().enumerate() {
                let candidates = policies
                    .iter()
                    .filter(|p| backend_ref.extension_refs.contains(&p.source))
                    .map(|policy| Candidate {
                        rank: RANK_EXTENSION,
                        policy,
                    })
                    .collect();
                let attached = self.evaluate(candidates);
                if !attached.policies.is_empty() {
                    out.route_backends.insert(
                        RouteBackendId {
                            rule: id.clone(),
                            backend: backend_idx,
                        },
                        attached,
                    );
                }

                if let Some(backend) = backend_ref.backend.as_deref() {
                    let name = backend.cluster_name();
                    if out.backends.contains_key(&name) {
                        continue;
                    }
                    let candidates = policies
                        .iter()
                        .filter(|policy| targets_backend(policy, backend))
                        .map(|policy| Candidate {
                            rank: RANK_GATEWAY,
                            policy,
                        })
                        .collect();
                    // Record empty results too so each backend is evaluated once.
                    out.backends.insert(name, self.evaluate(candidates));
                }
            }
        }
    }

    /// Determines the effective policy of each kind among the candidates for
    /// one attachment point and reports each candidate's outcome.
    fn evaluate(&mut self, candidates: Vec<Candidate<'_>>) -> AttachedPolicies {
        let resolver = self.resolver;
        let mut groups = BTreeMap::<PolicyKind, HashMap<PolicyKey, Candidate<'_>>>::new();
        for candidate in candidates {
            let key = candidate.policy.key();
            self.reached.insert(key.clone());
            let group = groups.entry(candidate.policy.kind()).or_default();
            match group.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(candidate);
                }
                // A policy may reach the same point through several targets;
                // the most specific one counts.
                Entry::Occupied(mut entry) => {
                    if candidate.rank > entry.get().rank {
                        entry.insert(candidate);
                    }
                }
            }
        }

        let mut attached = AttachedPolicies::default();
        for (kind, group) in groups {
            let Some(plugin) = resolver.registry.plugin(&kind) else {
                tracing::debug!(%kind, "No plugin registered for policy kind");
                continue;
            };

            let mut valid = Vec::with_capacity(group.len());
            for candidate in group.into_values() {
                if candidate.policy.is_valid() {
                    valid.push(candidate);
                } else {
                    // Invalid policies are reported on the ancestor but never
                    // take part in the merge.
                    self.reporter
                        .policy(candidate.policy.key(), candidate.policy.generation())
                        .ancestor(&self.ancestor);
                }
            }
            valid.sort_by(|a, b| resolver.ascending_priority(a, b));
            let Some(winner) = valid.last().copied() else {
                continue;
            };

            let merged = if plugin.merges() {
                let irs = valid
                    .iter()
                    .map(|c| c.policy.policy_ir.clone())
                    .collect::<Vec<_>>();
                plugin.merge_policies(&irs)
            } else {
                None
            };

            let effective = match merged {
                Some(MergedPolicy {
                    policy,
                    contributed,
                }) => {
                    for (i, candidate) in valid.iter().enumerate() {
                        let reason = if contributed.get(i).copied().unwrap_or(false) {
                            AttachmentReason::Merged
                        } else {
                            AttachmentReason::Overridden
                        };
                        self.report(candidate, reason);
                    }
                    policy
                }
                None => {
                    for candidate in &valid {
                        let reason = if std::ptr::eq(candidate.policy, winner.policy) {
                            AttachmentReason::Attached
                        } else {
                            AttachmentReason::Overridden
                        };
                        self.report(candidate, reason);
                    }
                    winner.policy.policy_ir.clone()
                }
            };
            attached.policies.insert(kind, effective);
        }
        attached
    }

    fn report(&mut self, candidate: &Candidate<'_>, reason: AttachmentReason) {
        tracing::trace!(policy = %candidate.policy.key(), ?reason, ancestor = %self.ancestor.name, "Resolved policy");
        self.reporter
            .policy(candidate.policy.key(), candidate.policy.generation())
            .attached(&self.ancestor, reason);
    }
}

fn listener_rank(policy: &PolicyWrapper, gateway: &ObjectSource, listener: &ListenerIr) -> Option<u8> {
    policy
        .target_refs
        .iter()
        .filter(|r| r.targets(&policy.source.namespace, gateway))
        .filter_map(|r| match (r.section_name.as_deref(), r.port) {
            (Some(section), _) if section == listener.name => Some(RANK_LISTENER),
            (None, Some(port)) if port == listener.port => Some(RANK_LISTENER),
            (None, None) => Some(RANK_GATEWAY),
            _ => None,
        })
        .max()
}

fn rule_rank(policy: &PolicyWrapper, route: &HttpRouteIr, rule: &RouteRuleIr) -> Option<u8> {
    let direct = policy
        .target_refs
        .iter()
        .filter(|r| r.targets(&policy.source.namespace, &route.source))
        .filter_map(|r| match r.section_name.as_deref() {
            None => Some(RANK_ROUTE),
            Some(section) if rule.name.as_deref() == Some(section) => Some(RANK_RULE),
            Some(_) => None,
        })
        .max();
    let extension = rule
        .extension_refs
        .contains(&policy.source)
        .then_some(RANK_EXTENSION);
    direct.max(extension)
}

fn targets_backend(policy: &PolicyWrapper, backend: &BackendObjectIr) -> bool {
    policy.target_refs.iter().any(|r| {
        r.targets(&policy.source.namespace, &backend.source)
            && r.port.map_or(true, |port| port == backend.port)
    })
}

// === impl AttachedPolicies ===

impl AttachedPolicies {
    pub fn get(&self, kind: &PolicyKind) -> Option<&dyn PolicyIr> {
        self.policies.get(kind).map(|policy| &**policy)
    }
}

// === impl GatewayPolicies ===

impl GatewayPolicies {
    pub fn listener(&self, name: &str) -> &AttachedPolicies {
        self.listeners.get(name).unwrap_or(&EMPTY)
    }

    pub fn rule(&self, id: &RuleId) -> &AttachedPolicies {
        self.rules.get(id).unwrap_or(&EMPTY)
    }

    pub fn route_backend(&self, id: &RouteBackendId) -> &AttachedPolicies {
        self.route_backends.get(id).unwrap_or(&EMPTY)
    }

    /// Policies attached to a backend, keyed by its cluster name.
    pub fn backend(&self, backend: &BackendObjectIr) -> &AttachedPolicies {
        self.backends
            .get(&backend.cluster_name())
            .unwrap_or(&EMPTY)
    }
}
