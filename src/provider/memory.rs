//! In-memory provider for tests and dry experiments.
//!
//! Objects are keyed by kind and remote name, the way the real services
//! identify them. Every create, update and delete is appended to a mutation
//! log (by resource id) so callers can assert on ordering and on idempotence.

use super::Provider;
use crate::core::codegen;
use crate::core::error::{Operation, ProviderError};
use crate::core::secret::Secret;
use crate::core::types::{
    AttrValue, Outputs, RecordedOutputs, ResourceKind, ResourceLock, ResourceSpec,
};
use crate::resources::str_attr;
use indexmap::IndexMap;

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub operation: Operation,
    pub resource: String,
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    objects: IndexMap<String, RecordedOutputs>,
    log: Vec<Mutation>,
    failures: Vec<(String, Operation)>,
    unreachable_probes: usize,
    probes: usize,
    serial: u32,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `operation` on `resource` with a provider error.
    pub fn fail_on(&mut self, resource: &str, operation: Operation) {
        self.failures.push((resource.to_string(), operation));
    }

    /// Fail the next `probes` reachability checks.
    pub fn unreachable_for(&mut self, probes: usize) {
        self.unreachable_probes = probes;
    }

    /// Insert an object as if it had been created outside this tool.
    pub fn seed(&mut self, kind: ResourceKind, name: &str, outputs: RecordedOutputs) {
        self.objects.insert(object_key(kind, name), outputs);
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<&RecordedOutputs> {
        self.objects.get(&object_key(kind, name))
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.log
    }

    pub fn mutation_count(&self) -> usize {
        self.log.len()
    }

    /// Mutations against one resource.
    pub fn mutations_of(&self, resource: &str) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|m| m.resource == resource)
            .map(|m| m.operation)
            .collect()
    }

    /// Position of the first `operation` on `resource` in the log.
    pub fn position(&self, resource: &str, operation: Operation) -> Option<usize> {
        self.log
            .iter()
            .position(|m| m.resource == resource && m.operation == operation)
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    fn check(&self, resource: &str, operation: Operation) -> Result<(), ProviderError> {
        if self
            .failures
            .iter()
            .any(|(r, op)| r == resource && *op == operation)
        {
            return Err(ProviderError::new(
                resource,
                operation,
                format!("InjectedFailure: {} rejected", operation),
            ));
        }
        Ok(())
    }

    fn record(&mut self, resource: &str, operation: Operation) {
        self.log.push(Mutation {
            operation,
            resource: resource.to_string(),
        });
    }

    /// Outputs the real service would report for `spec`.
    fn converge(&mut self, spec: &ResourceSpec, prior: Option<&RecordedOutputs>) -> Outputs {
        self.serial += 1;
        let serial = self.serial;
        let region = str_attr(spec, "region");
        let keep = |key: &str, fresh: String| -> AttrValue {
            prior
                .and_then(|p| p.get(key))
                .cloned()
                .unwrap_or(fresh)
                .into()
        };
        let mut out = Outputs::new();
        match spec.kind {
            ResourceKind::SecurityGroup => {
                out.insert("id".into(), keep("id", format!("sg-{:017x}", serial)));
                out.insert("vpc_id".into(), "vpc-0000000000000001".into());
            }
            ResourceKind::DatabaseInstance => {
                out.insert("id".into(), spec.name.clone().into());
                out.insert(
                    "arn".into(),
                    format!("arn:aws:rds:{}:000000000000:db:{}", region, spec.name).into(),
                );
                out.insert(
                    "address".into(),
                    format!("{}.memory.{}.rds.amazonaws.com", spec.name, region).into(),
                );
                out.insert("port".into(), "5432".into());
                out.insert("status".into(), "available".into());
                out.insert("engine_version".into(), str_attr(spec, "engine_version").into());
            }
            ResourceKind::Bucket => {
                out.insert("name".into(), spec.name.clone().into());
                out.insert("arn".into(), format!("arn:aws:s3:::{}", spec.name).into());
                out.insert("region".into(), region.into());
            }
            ResourceKind::IamPolicy => {
                out.insert(
                    "arn".into(),
                    format!("arn:aws:iam::000000000000:policy/{}", spec.name).into(),
                );
                out.insert("name".into(), spec.name.clone().into());
            }
            ResourceKind::IamUser => {
                out.insert("name".into(), spec.name.clone().into());
                out.insert(
                    "arn".into(),
                    format!("arn:aws:iam::000000000000:user/{}", spec.name).into(),
                );
            }
            ResourceKind::IamAccessKey => {
                out.insert("access_key_id".into(), format!("AKIA{:016}", serial).into());
                out.insert(
                    "secret_access_key".into(),
                    Secret::new("secret_access_key", format!("memory-secret-{:08}", serial)).into(),
                );
                out.insert("user".into(), str_attr(spec, "user").into());
            }
            ResourceKind::DatabaseRole => {
                out.insert("role".into(), spec.name.clone().into());
                out.insert("schema".into(), str_attr(spec, "schema").into());
                out.insert("database".into(), str_attr(spec, "database").into());
            }
            ResourceKind::ExternalSecret => {}
        }
        out
    }

    fn store(&mut self, spec: &ResourceSpec, outputs: &Outputs) {
        self.objects.insert(
            object_key(spec.kind, &spec.name),
            codegen::recordable_outputs(outputs),
        );
    }
}

fn object_key(kind: ResourceKind, name: &str) -> String {
    format!("{}/{}", kind, name)
}

impl Provider for MemoryProvider {
    fn read(&mut self, spec: &ResourceSpec) -> Result<Option<RecordedOutputs>, ProviderError> {
        self.check(&spec.id, Operation::Read)?;
        Ok(self.object(spec.kind, &spec.name).cloned())
    }

    fn create(&mut self, spec: &ResourceSpec) -> Result<Outputs, ProviderError> {
        self.check(&spec.id, Operation::Create)?;
        let outputs = self.converge(spec, None);
        self.store(spec, &outputs);
        self.record(&spec.id, Operation::Create);
        Ok(outputs)
    }

    fn update(
        &mut self,
        spec: &ResourceSpec,
        prior: &RecordedOutputs,
    ) -> Result<Outputs, ProviderError> {
        self.check(&spec.id, Operation::Update)?;
        if self.object(spec.kind, &spec.name).is_none() {
            return Err(ProviderError::new(
                &spec.id,
                Operation::Update,
                format!("NoSuchEntity: {} {} does not exist", spec.kind, spec.name),
            ));
        }
        let outputs = self.converge(spec, Some(prior));
        self.store(spec, &outputs);
        self.record(&spec.id, Operation::Update);
        Ok(outputs)
    }

    fn delete(&mut self, id: &str, lock: &ResourceLock) -> Result<(), ProviderError> {
        if matches!(lock.kind, ResourceKind::DatabaseRole | ResourceKind::ExternalSecret) {
            self.objects.shift_remove(&object_key(lock.kind, &lock.name));
            return Ok(());
        }
        self.check(id, Operation::Delete)?;
        if lock.kind == ResourceKind::DatabaseInstance
            && lock.details.get("deletion_protection").is_some_and(|v| v == "true")
        {
            return Err(ProviderError::new(
                id,
                Operation::Delete,
                format!(
                    "InvalidParameterCombination: Cannot delete protected DB Instance, \
                     please disable deletion protection and try again. ({})",
                    lock.name
                ),
            ));
        }
        self.objects.shift_remove(&object_key(lock.kind, &lock.name));
        self.record(id, Operation::Delete);
        Ok(())
    }

    fn probe(&mut self, _spec: &ResourceSpec) -> Result<(), String> {
        self.probes += 1;
        if self.unreachable_probes > 0 {
            self.unreachable_probes -= 1;
            return Err("could not connect to server: Connection timed out".to_string());
        }
        Ok(())
    }
}
