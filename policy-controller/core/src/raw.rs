use crate::{ObjectSource, ObjectVersion, PolicyError, PolicyRef};
use chrono::{offset::Utc, DateTime};
use gateway_policy_controller_k8s_api::PolicyStatus;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Policies with a higher weight annotation take precedence over policies of
/// the same kind with a lower weight.
pub const WEIGHT_ANNOTATION: &str = "policy.gateway.dev/weight";

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// An attachable policy as read from the API, before its kind's plugin has
/// parsed the spec.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,

    /// The status last observed on the object, if any.
    #[serde(default)]
    pub status: Option<PolicyStatus>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetRefs {
    #[serde(default)]
    target_refs: Vec<PolicyRef>,
}

// === impl RawPolicy ===

impl RawPolicy {
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
    }

    pub fn source(&self) -> ObjectSource {
        ObjectSource::new(
            self.group(),
            &self.kind,
            &self.metadata.namespace,
            &self.metadata.name,
        )
    }

    pub fn version(&self) -> ObjectVersion {
        ObjectVersion {
            generation: self.metadata.generation,
            resource_version: self.metadata.resource_version.clone(),
            uid: self.metadata.uid.clone(),
        }
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.metadata
            .creation_timestamp
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn precedence_weight(&self) -> Result<i32, PolicyError> {
        match self.metadata.annotations.get(WEIGHT_ANNOTATION) {
            None => Ok(0),
            Some(weight) => weight
                .trim()
                .parse()
                .map_err(|error| PolicyError::invalid_field(WEIGHT_ANNOTATION, error)),
        }
    }

    /// Reads `spec.targetRefs` independently of the rest of the spec so that a
    /// policy with an invalid spec can still be reported on its targets.
    pub fn target_refs(&self) -> Result<Vec<PolicyRef>, PolicyError> {
        serde_json::from_value::<TargetRefs>(self.spec.clone())
            .map(|TargetRefs { target_refs }| target_refs)
            .map_err(|error| PolicyError::invalid_field("targetRefs", error))
    }

    pub fn spec<T: DeserializeOwned>(&self) -> Result<T, PolicyError> {
        serde_json::from_value(self.spec.clone())
            .map_err(|error| PolicyError::invalid_field("spec", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn raw(annotations: BTreeMap<String, String>) -> RawPolicy {
        RawPolicy {
            api_version: "policy.gateway.dev/v1alpha1".to_string(),
            kind: "TrafficPolicy".to_string(),
            metadata: ObjectMeta {
                name: "tp".to_string(),
                namespace: "default".to_string(),
                generation: 3,
                annotations,
                ..Default::default()
            },
            spec: serde_json::json!({
                "targetRefs": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "HTTPRoute",
                    "name": "example-route",
                }],
            }),
            status: None,
        }
    }

    #[test]
    fn source_and_version() {
        let policy = raw(BTreeMap::new());
        assert_eq!(
            policy.source(),
            ObjectSource::new("policy.gateway.dev", "TrafficPolicy", "default", "tp")
        );
        assert_eq!(policy.version().generation, 3);
        assert_eq!(policy.creation_time(), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn weights() {
        assert_eq!(raw(BTreeMap::new()).precedence_weight(), Ok(0));
        assert_eq!(
            raw(btreemap! { WEIGHT_ANNOTATION.to_string() => "7".to_string() }).precedence_weight(),
            Ok(7)
        );
        assert!(
            raw(btreemap! { WEIGHT_ANNOTATION.to_string() => "high".to_string() })
                .precedence_weight()
                .is_err()
        );
    }

    #[test]
    fn target_refs() {
        let refs = raw(BTreeMap::new()).target_refs().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "example-route");
        assert_eq!(refs[0].namespace, None);
    }
}
