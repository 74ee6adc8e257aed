//! Resource, state, and plan types.
//!
//! A [`ResourceSpec`] is the desired state of one infrastructure object.
//! A [`StateLock`] is the persisted record of what the last apply produced.

use super::secret::Secret;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Resources
// ============================================================================

/// Kind of infrastructure object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    SecurityGroup,
    DatabaseInstance,
    Bucket,
    IamPolicy,
    IamUser,
    IamAccessKey,
    DatabaseRole,
    ExternalSecret,
}

impl ResourceKind {
    /// Applying this kind needs a reachable database.
    pub fn requires_database(self) -> bool {
        matches!(self, Self::DatabaseRole)
    }

    /// This kind returns a secret only at creation time.
    pub fn mints_secret(self) -> bool {
        matches!(self, Self::IamAccessKey)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityGroup => write!(f, "security_group"),
            Self::DatabaseInstance => write!(f, "database_instance"),
            Self::Bucket => write!(f, "bucket"),
            Self::IamPolicy => write!(f, "iam_policy"),
            Self::IamUser => write!(f, "iam_user"),
            Self::IamAccessKey => write!(f, "iam_access_key"),
            Self::DatabaseRole => write!(f, "database_role"),
            Self::ExternalSecret => write!(f, "external_secret"),
        }
    }
}

/// Pointer to an output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub resource: String,
    pub output: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}

/// Attribute value. `Ref` is replaced by the referenced output before apply.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
    Ref(Reference),
    Secret(Secret),
}

impl AttrValue {
    pub fn reference(resource: &str, output: &str) -> Self {
        Self::Ref(Reference {
            resource: resource.to_string(),
            output: output.to_string(),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            Self::Secret(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical text used for hashing. Secrets contribute a fingerprint.
    pub fn hash_component(&self) -> String {
        match self {
            Self::Str(s) => format!("s:{}", s),
            Self::Bool(b) => format!("b:{}", b),
            Self::Int(i) => format!("i:{}", i),
            Self::List(l) => format!("l:{}", l.join("\u{1f}")),
            Self::Ref(r) => format!("r:{}", r),
            Self::Secret(s) => format!("x:{}", s.fingerprint()),
        }
    }

    /// Text form for state records. `None` for references and secrets.
    pub fn recordable(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::List(l) => Some(l.join(",")),
            Self::Ref(_) | Self::Secret(_) => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(l: Vec<String>) -> Self {
        Self::List(l)
    }
}

impl From<Secret> for AttrValue {
    fn from(s: Secret) -> Self {
        Self::Secret(s)
    }
}

/// Ordered attribute mapping.
pub type Attributes = IndexMap<String, AttrValue>;

/// Values a provider reports back after create/update.
pub type Outputs = IndexMap<String, AttrValue>;

/// Outputs as recorded in state (non-sensitive only).
pub type RecordedOutputs = IndexMap<String, String>;

/// Desired state of one infrastructure object.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    /// Stack-local identifier (graph node)
    pub id: String,

    pub kind: ResourceKind,

    /// Remote identity (bucket name, instance identifier, role name, ...)
    pub name: String,

    pub attributes: Attributes,

    /// Explicit dependencies beyond those implied by references
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: &str, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            kind,
            name: name.into(),
            attributes: IndexMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn after(mut self, id: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == id) {
            self.depends_on.push(id.to_string());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// References embedded in attribute values, in attribute order.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.attributes.values().filter_map(|v| match v {
            AttrValue::Ref(r) => Some(r),
            _ => None,
        })
    }

    /// All resources this one needs first: explicit edges, then referenced ones.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let referenced = self.references().map(|r| &r.resource);
        for dep in self.depends_on.iter().chain(referenced) {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        deps
    }
}

// ============================================================================
// State / Lock
// ============================================================================

/// Persisted state blob for one environment and region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    /// Schema version
    pub schema: String,

    /// Project the stack belongs to
    pub stack: String,

    pub environment: String,

    pub region: String,

    /// When the lock was last written
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Per-resource state, in apply order
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub kind: ResourceKind,

    /// Remote identity
    pub name: String,

    pub status: ResourceStatus,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// BLAKE3 hash of the desired state that produced this entry
    pub hash: String,

    /// Resources this one depended on when applied
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Non-sensitive outputs (ids, ARNs, endpoints)
    #[serde(default)]
    pub outputs: RecordedOutputs,

    /// Non-sensitive attributes needed to tear the resource down
    #[serde(default)]
    pub details: RecordedOutputs,

    /// Fingerprint of the values last pushed (external secrets only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

/// Resource convergence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Converged,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub action: PlanAction,
    /// Human-readable description
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub stack: String,
    pub environment: String,

    /// Changes in execution order; destroys of undeclared resources come last
    pub changes: Vec<PlannedChange>,

    /// Topological apply order (resource ids)
    pub execution_order: Vec<String>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_destroy > 0
    }

    pub fn change(&self, resource_id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.resource_id == resource_id)
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log. Never carries secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        environment: String,
        run_id: String,
        version: String,
    },
    ResourceStarted {
        environment: String,
        resource: String,
        action: String,
    },
    ResourceConverged {
        environment: String,
        resource: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        environment: String,
        resource: String,
        error: String,
    },
    SecretPushed {
        environment: String,
        resource: String,
        store: String,
    },
    ResourceDestroyed {
        environment: String,
        resource: String,
    },
    ApplyCompleted {
        environment: String,
        run_id: String,
        mutations: u32,
        unchanged: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of an apply run.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub created: u32,
    pub updated: u32,
    pub destroyed: u32,
    pub unchanged: u32,
    pub secret_pushes: u32,
    /// Secret pushes that failed; reported, not fatal
    pub warnings: Vec<String>,
    pub total_duration: std::time::Duration,
}

impl ApplyResult {
    /// Remote mutations issued during the run.
    pub fn mutations(&self) -> u32 {
        self.created + self.updated + self.destroyed + self.secret_pushes
    }
}

/// Outcome of a destroy run.
#[derive(Debug, Clone, Default)]
pub struct DestroyResult {
    pub destroyed: Vec<String>,
    pub total_duration: std::time::Duration,
}
