use chrono::{offset::Utc, DateTime};

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
pub const GATEWAY_KIND: &str = "Gateway";

pub mod conditions {
    pub const ACCEPTED: &str = "Accepted";
    pub const ATTACHED: &str = "Attached";

    pub const STATUS_TRUE: &str = "True";
    pub const STATUS_FALSE: &str = "False";
}

pub mod reasons {
    pub const VALID: &str = "Valid";
    pub const INVALID: &str = "Invalid";
    pub const ATTACHED: &str = "Attached";
    pub const MERGED: &str = "Merged";
    pub const OVERRIDDEN: &str = "Overridden";
}

pub mod messages {
    pub const ACCEPTED: &str = "Policy accepted";
    pub const ATTACHED: &str = "Attached to all targets";
    pub const MERGED: &str = "Merged with other policies in target(s) and attached";
    pub const OVERRIDDEN: &str = "Overridden due to conflict with higher priority policy in target(s)";
}

/// The status subresource shared by all attachable policy kinds.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub ancestors: Vec<PolicyAncestorStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAncestorStatus {
    pub ancestor_ref: ParentReference,
    pub controller_name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    pub last_transition_time: DateTime<Utc>,
}

// === impl PolicyStatus ===

impl PolicyStatus {
    pub fn ancestor(
        &self,
        ancestor_ref: &ParentReference,
        controller_name: &str,
    ) -> Option<&PolicyAncestorStatus> {
        self.ancestors
            .iter()
            .find(|a| a.ancestor_ref == *ancestor_ref && a.controller_name == controller_name)
    }

    /// Builds the JSON merge patch that replaces an object's status.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        serde_json::json!({ "status": self })
    }
}

// === impl PolicyAncestorStatus ===

impl PolicyAncestorStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

// === impl ParentReference ===

impl ParentReference {
    pub fn gateway(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            group: Some(GATEWAY_API_GROUP.to_string()),
            kind: Some(GATEWAY_KIND.to_string()),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            section_name: None,
            port: None,
        }
    }
}

// === impl Condition ===

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == conditions::STATUS_TRUE
    }
}
