//! Provider backed by the `aws` and `psql` command-line tools.

use super::Provider;
use crate::core::codegen;
use crate::core::error::{Operation, ProviderError};
use crate::core::types::{Outputs, RecordedOutputs, ResourceLock, ResourceSpec};
use crate::transport::{ExecOutput, LocalTransport, Transport};
use std::time::Instant;

pub struct CliProvider<T: Transport = LocalTransport> {
    transport: T,
}

impl<T: Transport> CliProvider<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn run(&self, id: &str, operation: Operation, script: &str) -> Result<ExecOutput, ProviderError> {
        let started = Instant::now();
        let out = self
            .transport
            .exec(script)
            .map_err(|e| ProviderError::new(id, operation, e))?;
        tracing::debug!(
            resource = id,
            %operation,
            exit_code = out.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "script finished"
        );
        if !out.success() {
            return Err(ProviderError::new(id, operation, out.error_message()));
        }
        Ok(out)
    }

    fn converge(
        &self,
        spec: &ResourceSpec,
        operation: Operation,
        script: Result<zeroize::Zeroizing<String>, String>,
    ) -> Result<Outputs, ProviderError> {
        let script = script.map_err(|e| ProviderError::new(&spec.id, operation, e))?;
        let out = self.run(&spec.id, operation, &script)?;
        codegen::parse_outputs(&out.stdout).map_err(|e| ProviderError::new(&spec.id, operation, e))
    }
}

impl Default for CliProvider<LocalTransport> {
    fn default() -> Self {
        Self::new(LocalTransport)
    }
}

impl<T: Transport> Provider for CliProvider<T> {
    fn read(&mut self, spec: &ResourceSpec) -> Result<Option<RecordedOutputs>, ProviderError> {
        let script =
            codegen::read_script(spec).map_err(|e| ProviderError::new(&spec.id, Operation::Read, e))?;
        let out = self.run(&spec.id, Operation::Read, &script)?;
        codegen::parse_read(&out.stdout).map_err(|e| ProviderError::new(&spec.id, Operation::Read, e))
    }

    fn create(&mut self, spec: &ResourceSpec) -> Result<Outputs, ProviderError> {
        self.converge(spec, Operation::Create, codegen::create_script(spec))
    }

    fn update(
        &mut self,
        spec: &ResourceSpec,
        prior: &RecordedOutputs,
    ) -> Result<Outputs, ProviderError> {
        self.converge(spec, Operation::Update, codegen::update_script(spec, prior))
    }

    fn delete(&mut self, id: &str, lock: &ResourceLock) -> Result<(), ProviderError> {
        match codegen::delete_script(lock) {
            Some(script) => self.run(id, Operation::Delete, &script).map(|_| ()),
            None => Ok(()),
        }
    }

    fn probe(&mut self, spec: &ResourceSpec) -> Result<(), String> {
        let Some(script) = codegen::probe_script(spec) else {
            return Ok(());
        };
        let out = self.transport.exec(&script)?;
        if out.success() {
            Ok(())
        } else {
            Err(out.error_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttrValue, ResourceKind, ResourceStatus};
    use std::cell::RefCell;
    use zeroize::Zeroizing;

    /// Replays canned outputs and records the scripts it was given.
    struct Canned {
        replies: RefCell<Vec<(i32, String, String)>>,
        scripts: RefCell<Vec<String>>,
    }

    impl Canned {
        fn new(replies: &[(i32, &str, &str)]) -> Self {
            Self {
                replies: RefCell::new(
                    replies
                        .iter()
                        .rev()
                        .map(|(c, o, e)| (*c, o.to_string(), e.to_string()))
                        .collect(),
                ),
                scripts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for &Canned {
        fn exec(&self, script: &str) -> Result<ExecOutput, String> {
            self.scripts.borrow_mut().push(script.to_string());
            let (exit_code, stdout, stderr) = self
                .replies
                .borrow_mut()
                .pop()
                .ok_or_else(|| "no reply".to_string())?;
            Ok(ExecOutput {
                exit_code,
                stdout: Zeroizing::new(stdout),
                stderr,
            })
        }
    }

    fn bucket() -> ResourceSpec {
        ResourceSpec::new("bucket", ResourceKind::Bucket, "agd-dev-tyson")
            .attr("region", "ca-central-1")
            .attr("versioning", true)
            .attr("encryption", "AES256")
    }

    #[test]
    fn test_cli_read_absent() {
        let canned = Canned::new(&[(0, "", "")]);
        let mut p = CliProvider::new(&canned);
        assert!(p.read(&bucket()).unwrap().is_none());
        assert!(canned.scripts.borrow()[0].contains("head-bucket"));
    }

    #[test]
    fn test_cli_create_parses_outputs() {
        let canned = Canned::new(&[(0, "{\"name\":\"agd-dev-tyson\",\"arn\":\"arn:aws:s3:::agd-dev-tyson\"}", "")]);
        let mut p = CliProvider::new(&canned);
        let outputs = p.create(&bucket()).unwrap();
        assert_eq!(outputs["arn"], AttrValue::from("arn:aws:s3:::agd-dev-tyson"));
    }

    #[test]
    fn test_cli_rejection_carries_operation() {
        let canned = Canned::new(&[(
            254,
            "",
            "An error occurred (BucketAlreadyExists) when calling the CreateBucket operation",
        )]);
        let mut p = CliProvider::new(&canned);
        let err = p.create(&bucket()).unwrap_err();
        assert_eq!(err.resource, "bucket");
        assert_eq!(err.operation, Operation::Create);
        assert!(err.message.contains("BucketAlreadyExists"));
    }

    #[test]
    fn test_cli_delete_state_only_kinds() {
        let canned = Canned::new(&[]);
        let mut p = CliProvider::new(&canned);
        let lock = ResourceLock {
            kind: ResourceKind::DatabaseRole,
            name: "modal_user".into(),
            status: ResourceStatus::Converged,
            applied_at: None,
            duration_seconds: None,
            hash: String::new(),
            depends_on: vec![],
            outputs: RecordedOutputs::new(),
            details: RecordedOutputs::new(),
            trigger: None,
        };
        p.delete("db-app-role", &lock).unwrap();
        assert!(canned.scripts.borrow().is_empty());
    }

    #[test]
    fn test_cli_probe_reports_stderr() {
        let canned = Canned::new(&[(2, "", "psql: error: connection to server failed: timeout expired")]);
        let mut p = CliProvider::new(&canned);
        let role = ResourceSpec::new("db-app-role", ResourceKind::DatabaseRole, "modal_user")
            .attr("host", "db.example")
            .attr("port", "5432");
        let err = p.probe(&role).unwrap_err();
        assert!(err.contains("timeout expired"));
        assert!(p.probe(&bucket()).is_ok());
    }
}
