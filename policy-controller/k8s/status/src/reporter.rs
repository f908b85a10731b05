use chrono::{offset::Utc, DateTime};
use gateway_policy_controller_core::{AttachmentReason, ObjectSource, PolicyError, PolicyKey};
use gateway_policy_controller_k8s_api::status::{
    conditions, messages, reasons, Condition, ParentReference, PolicyAncestorStatus, PolicyStatus,
};
use std::collections::BTreeMap;

/// Collects what happened to each policy during one translation cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reporter {
    policies: BTreeMap<PolicyKey, PolicyReport>,
}

/// A handle for reporting on a single policy.
#[derive(Debug)]
pub struct PolicyReporter<'r> {
    report: &'r mut PolicyReport,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct PolicyReport {
    generation: i64,
    errors: Vec<String>,

    /// Every ancestor the policy reached, with the strongest attachment
    /// outcome seen under it. Invalid policies reach ancestors without an
    /// outcome.
    ancestors: BTreeMap<ParentReference, Option<AttachmentReason>>,
}

// === impl Reporter ===

impl Reporter {
    pub fn policy(&mut self, key: PolicyKey, generation: i64) -> PolicyReporter<'_> {
        let report = self.policies.entry(key).or_default();
        report.generation = generation;
        PolicyReporter { report }
    }

    pub fn contains(&self, key: &PolicyKey) -> bool {
        self.policies.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &PolicyKey> {
        self.policies.keys()
    }

    /// Returns the strongest outcome recorded for a policy under an ancestor.
    pub fn attachment(
        &self,
        key: &PolicyKey,
        ancestor: &ParentReference,
    ) -> Option<AttachmentReason> {
        self.policies.get(key)?.ancestors.get(ancestor).copied()?
    }

    /// Renders a policy's status.
    ///
    /// `previous` is the status currently on the object. Ancestors it holds
    /// for other controllers are preserved; ancestors this controller wrote
    /// that were not reached this cycle are dropped. A condition whose status
    /// did not change keeps its previous transition time, so rendering the
    /// same report twice yields identical statuses.
    pub fn render(
        &self,
        key: &PolicyKey,
        previous: Option<&PolicyStatus>,
        controller_name: &str,
        now: DateTime<Utc>,
    ) -> PolicyStatus {
        let mut ancestors = self
            .policies
            .get(key)
            .map(|report| report.render(previous, controller_name, now))
            .unwrap_or_default();

        if let Some(previous) = previous {
            ancestors.extend(
                previous
                    .ancestors
                    .iter()
                    .filter(|a| a.controller_name != controller_name)
                    .cloned(),
            );
        }

        PolicyStatus { ancestors }
    }
}

// === impl PolicyReporter ===

impl PolicyReporter<'_> {
    pub fn set_errors(&mut self, errors: &[PolicyError]) {
        self.report.errors = errors.iter().map(ToString::to_string).collect();
    }

    /// Records that the policy reached a gateway without being attached.
    pub fn ancestor(&mut self, ancestor: &ParentReference) {
        self.report.ancestors.entry(ancestor.clone()).or_default();
    }

    /// Records an attachment outcome, keeping the strongest outcome per
    /// ancestor.
    pub fn attached(&mut self, ancestor: &ParentReference, reason: AttachmentReason) {
        let current = self.report.ancestors.entry(ancestor.clone()).or_default();
        *current = (*current).max(Some(reason));
    }
}

// === impl PolicyReport ===

impl PolicyReport {
    fn render(
        &self,
        previous: Option<&PolicyStatus>,
        controller_name: &str,
        now: DateTime<Utc>,
    ) -> Vec<PolicyAncestorStatus> {
        self.ancestors
            .iter()
            .map(|(ancestor_ref, reason)| {
                let previous = previous.and_then(|s| s.ancestor(ancestor_ref, controller_name));
                let condition = |type_: &str, status: &str, reason: &str, message: &str| {
                    let last_transition_time = previous
                        .and_then(|p| p.condition(type_))
                        .filter(|c| c.status == status)
                        .map(|c| c.last_transition_time)
                        .unwrap_or(now);
                    Condition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        reason: reason.to_string(),
                        message: message.to_string(),
                        observed_generation: Some(self.generation),
                        last_transition_time,
                    }
                };

                let mut conds = Vec::with_capacity(2);
                if self.errors.is_empty() {
                    conds.push(condition(
                        conditions::ACCEPTED,
                        conditions::STATUS_TRUE,
                        reasons::VALID,
                        messages::ACCEPTED,
                    ));
                    if let Some(reason) = reason {
                        let (status, reason, message) = match reason {
                            AttachmentReason::Attached => {
                                (conditions::STATUS_TRUE, reasons::ATTACHED, messages::ATTACHED)
                            }
                            AttachmentReason::Merged => {
                                (conditions::STATUS_TRUE, reasons::MERGED, messages::MERGED)
                            }
                            AttachmentReason::Overridden => (
                                conditions::STATUS_FALSE,
                                reasons::OVERRIDDEN,
                                messages::OVERRIDDEN,
                            ),
                        };
                        conds.push(condition(conditions::ATTACHED, status, reason, message));
                    }
                } else {
                    conds.push(condition(
                        conditions::ACCEPTED,
                        conditions::STATUS_FALSE,
                        reasons::INVALID,
                        &self.errors.join("; "),
                    ));
                }

                PolicyAncestorStatus {
                    ancestor_ref: ancestor_ref.clone(),
                    controller_name: controller_name.to_string(),
                    conditions: conds,
                }
            })
            .collect()
    }
}

/// The ancestor reference for policies that reach targets through a gateway.
pub fn gateway_ancestor(gateway: &ObjectSource) -> ParentReference {
    ParentReference::gateway(&gateway.namespace, &gateway.name)
}
