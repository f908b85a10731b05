use chrono::{offset::Utc, DateTime};
use std::{any::Any, fmt, str::FromStr, sync::Arc};

/// Identifies any object in the control plane's view of the world.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ObjectSource {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// A reference from a policy to the object it targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Uniquely identifies a policy object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct PolicyKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKind {
    pub group: String,
    pub kind: String,
}

/// Describes a policy kind well enough to write its status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyKindInfo {
    pub kind: PolicyKind,
    pub version: String,
    pub plural: String,
}

#[derive(Clone, Debug, Default)]
pub struct ObjectVersion {
    pub generation: i64,
    pub resource_version: String,
    pub uid: String,
}

/// The plugin-specific, opaque intermediate representation of a policy.
///
/// Only the plugin that produced an IR knows its concrete type; it recovers it
/// with [`PolicyIr::as_any`].
pub trait PolicyIr: Any + fmt::Debug + Send + Sync {
    /// Orders policies of the same kind that are otherwise equal in priority.
    fn creation_time(&self) -> DateTime<Utc>;

    /// Compares this IR with another of, presumably, the same kind.
    ///
    /// Must return false when `other` is of a different concrete type.
    fn equals(&self, other: &dyn PolicyIr) -> bool;

    fn as_any(&self) -> &dyn Any;
}

pub type SharedPolicyIr = Arc<dyn PolicyIr>;

/// A user-facing structural error in a policy.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PolicyError {
    message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("policy {policy} is not attachable to any object")]
pub struct NotAttachable {
    pub policy: PolicyKey,
}

/// A parsed policy along with the metadata needed to attach, order and report
/// on it.
#[derive(Clone, Debug)]
pub struct PolicyWrapper {
    pub source: ObjectSource,
    pub version: ObjectVersion,

    /// Structural errors found while building the IR. A policy with any errors
    /// is never attached.
    pub errors: Vec<PolicyError>,
    pub target_refs: Vec<PolicyRef>,
    pub policy_ir: SharedPolicyIr,

    /// Higher weights take precedence over lower weights.
    pub precedence_weight: i32,
}

/// Controls how policies inherited from a parent rank against policies
/// attached directly to a child.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum InheritedPolicyPriority {
    /// More specific attachments take precedence.
    #[default]
    PreferChild,
    PreferParent,
}

/// How a policy ended up contributing to a target, ordered from weakest to
/// strongest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentReason {
    Overridden,
    Merged,
    Attached,
}

/// Compares a concrete IR against an opaque one.
pub fn ir_equals<T>(this: &T, other: &dyn PolicyIr) -> bool
where
    T: PolicyIr + PartialEq,
{
    other
        .as_any()
        .downcast_ref::<T>()
        .is_some_and(|other| this == other)
}

// === impl ObjectSource ===

impl ObjectSource {
    pub fn new(
        group: impl ToString,
        kind: impl ToString,
        namespace: impl ToString,
        name: impl ToString,
    ) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn resource_name(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }

    pub fn is_kind(&self, group: &str, kind: &str) -> bool {
        self.group == group && self.kind == kind
    }
}

impl fmt::Display for ObjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}.{} {}/{}",
                self.kind, self.group, self.namespace, self.name
            )
        }
    }
}

// === impl PolicyRef ===

impl PolicyRef {
    /// Returns true if this reference, written in `policy_ns`, names `obj`.
    ///
    /// Section names and ports are not considered.
    pub fn targets(&self, policy_ns: &str, obj: &ObjectSource) -> bool {
        self.group == obj.group
            && self.kind == obj.kind
            && self.name == obj.name
            && self.namespace.as_deref().unwrap_or(policy_ns) == obj.namespace
    }
}

// === impl PolicyKey ===

impl From<&ObjectSource> for PolicyKey {
    fn from(source: &ObjectSource) -> Self {
        Self {
            group: source.group.clone(),
            kind: source.kind.clone(),
            namespace: source.namespace.clone(),
            name: source.name.clone(),
        }
    }
}

impl PolicyKey {
    pub fn kind(&self) -> PolicyKind {
        PolicyKind::new(&self.group, &self.kind)
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}/{}/{}",
            self.kind, self.group, self.namespace, self.name
        )
    }
}

// === impl PolicyKind ===

impl PolicyKind {
    pub fn new(group: impl ToString, kind: impl ToString) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn matches(&self, source: &ObjectSource) -> bool {
        source.is_kind(&self.group, &self.kind)
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.group)
    }
}

// === impl PolicyKindInfo ===

impl PolicyKindInfo {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.kind.group, self.version)
    }
}

// === impl ObjectVersion ===

impl ObjectVersion {
    /// Generations are compared when both sides have one; otherwise resource
    /// versions are. The UID must always match.
    pub fn version_equals(&self, other: &Self) -> bool {
        let same_version = if self.generation != 0 && other.generation != 0 {
            self.generation == other.generation
        } else {
            self.resource_version == other.resource_version
        };
        same_version && self.uid == other.uid
    }
}

// === impl PolicyError ===

impl PolicyError {
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn invalid_field(field: &str, error: impl fmt::Display) -> Self {
        Self::new(format!("invalid {field}: {error}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// === impl PolicyWrapper ===

impl PolicyWrapper {
    pub fn key(&self) -> PolicyKey {
        PolicyKey::from(&self.source)
    }

    pub fn kind(&self) -> PolicyKind {
        PolicyKind::new(&self.source.group, &self.source.kind)
    }

    pub fn generation(&self) -> i64 {
        self.version.generation
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.policy_ir.creation_time()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn equals(&self, other: &Self) -> bool {
        self.source == other.source
            && self.version.version_equals(&other.version)
            && self.errors == other.errors
            && self.target_refs == other.target_refs
            && self.precedence_weight == other.precedence_weight
            && self.policy_ir.equals(&*other.policy_ir)
    }
}

impl PartialEq for PolicyWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

// === impl InheritedPolicyPriority ===

impl FromStr for InheritedPolicyPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-child" | "PreferChild" => Ok(Self::PreferChild),
            "prefer-parent" | "PreferParent" => Ok(Self::PreferParent),
            s => anyhow::bail!("invalid inherited policy priority: {s}"),
        }
    }
}
