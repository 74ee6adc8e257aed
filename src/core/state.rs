//! State blob management: load, save (atomic), location derivation.
//!
//! The blob is one YAML document per environment and region, kept either on
//! local disk or in an S3 object.

use super::codegen::quote;
use super::environment::StateBackend;
use super::error::StateError;
use super::types::StateLock;
use crate::transport::{LocalTransport, Transport};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "state.lock.yaml";
const ABSENT_MARKER: &str = "__STRATUM_STATE_ABSENT__";

/// Where the state blob is kept.
pub trait StateStore {
    /// Load the blob. `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<StateLock>, StateError>;

    fn save(&self, lock: &StateLock) -> Result<(), StateError>;

    /// Human-readable location.
    fn describe(&self) -> String;
}

/// Derive the lock file path within the state directory.
pub fn lock_file_path(state_dir: &Path, environment: &str, region: &str) -> PathBuf {
    state_dir.join(environment).join(region).join(LOCK_FILE)
}

/// Object key of the lock under an S3 prefix.
pub fn lock_object_key(prefix: &str, environment: &str, region: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}/{}", environment, region, LOCK_FILE)
    } else {
        format!("{}/{}/{}/{}", prefix, environment, region, LOCK_FILE)
    }
}

fn parse_lock(content: &str, location: &str) -> Result<StateLock, StateError> {
    serde_yaml_ng::from_str(content).map_err(|e| StateError::Corrupt {
        location: location.to_string(),
        message: e.to_string(),
    })
}

fn render_lock(lock: &StateLock, location: &str) -> Result<String, StateError> {
    serde_yaml_ng::to_string(lock).map_err(|e| StateError::Write {
        location: location.to_string(),
        message: format!("serialize error: {}", e),
    })
}

/// Lock file on local disk.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    path: PathBuf,
}

impl LocalStateStore {
    pub fn new(state_dir: &Path, environment: &str, region: &str) -> Self {
        Self {
            path: lock_file_path(state_dir, environment, region),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for LocalStateStore {
    fn load(&self) -> Result<Option<StateLock>, StateError> {
        let location = self.describe();
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| StateError::Read {
            location: location.clone(),
            message: e.to_string(),
        })?;
        parse_lock(&content, &location).map(Some)
    }

    /// Atomic write: temp file + rename.
    fn save(&self, lock: &StateLock) -> Result<(), StateError> {
        let location = self.describe();
        let write_err = |message: String| StateError::Write {
            location: location.clone(),
            message,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| write_err(format!("cannot create dir {}: {}", parent.display(), e)))?;
        }

        let yaml = render_lock(lock, &location)?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml)
            .map_err(|e| write_err(format!("cannot write {}: {}", tmp_path.display(), e)))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| write_err(format!("cannot rename {}: {}", tmp_path.display(), e)))?;
        tracing::debug!(path = %self.path.display(), resources = lock.resources.len(), "state saved");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Lock object in S3, accessed through the AWS CLI.
pub struct S3StateStore<T: Transport = LocalTransport> {
    bucket: String,
    key: String,
    region: String,
    transport: T,
}

impl<T: Transport> S3StateStore<T> {
    pub fn new(
        bucket: &str,
        prefix: &str,
        environment: &str,
        region: &str,
        transport: T,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: lock_object_key(prefix, environment, region),
            region: region.to_string(),
            transport,
        }
    }

    fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Script that prints the lock, or the absent marker if there is none.
    pub fn load_script(&self) -> String {
        format!(
            "set -uo pipefail\n\
             export AWS_REGION={region}\n\
             if ! out=$(aws s3api head-object --bucket {bucket} --key {key} 2>&1); then\n\
             \x20 case \"$out\" in\n\
             \x20   *'Not Found'*|*404*|*NoSuchKey*) echo '{marker}'; exit 0 ;;\n\
             \x20 esac\n\
             \x20 echo \"$out\" >&2\n\
             \x20 exit 1\n\
             fi\n\
             aws s3 cp {uri} -\n",
            region = quote(&self.region),
            bucket = quote(&self.bucket),
            key = quote(&self.key),
            marker = ABSENT_MARKER,
            uri = quote(&self.uri()),
        )
    }

    /// Script that uploads `yaml` from a heredoc.
    pub fn save_script(&self, yaml: &str) -> String {
        format!(
            "set -euo pipefail\n\
             export AWS_REGION={region}\n\
             aws s3 cp - {uri} --sse AES256 --content-type application/yaml <<'STRATUM_STATE'\n\
             {yaml}\
             STRATUM_STATE\n",
            region = quote(&self.region),
            uri = quote(&self.uri()),
            yaml = yaml,
        )
    }
}

impl<T: Transport> StateStore for S3StateStore<T> {
    fn load(&self) -> Result<Option<StateLock>, StateError> {
        let location = self.describe();
        let out = self
            .transport
            .exec(&self.load_script())
            .map_err(|message| StateError::Read {
                location: location.clone(),
                message,
            })?;
        if !out.success() {
            return Err(StateError::Read {
                location,
                message: out.error_message(),
            });
        }
        if out.stdout.trim() == ABSENT_MARKER {
            return Ok(None);
        }
        parse_lock(&out.stdout, &location).map(Some)
    }

    fn save(&self, lock: &StateLock) -> Result<(), StateError> {
        let location = self.describe();
        let yaml = render_lock(lock, &location)?;
        let out = self
            .transport
            .exec(&self.save_script(&yaml))
            .map_err(|message| StateError::Write {
                location: location.clone(),
                message,
            })?;
        if !out.success() {
            return Err(StateError::Write {
                location,
                message: out.error_message(),
            });
        }
        tracing::debug!(uri = %self.uri(), "state saved");
        Ok(())
    }

    fn describe(&self) -> String {
        self.uri()
    }
}

/// Open the store configured for an environment.
pub fn open_store(
    backend: &StateBackend,
    state_dir: &Path,
    environment: &str,
    region: &str,
) -> Box<dyn StateStore> {
    match backend {
        StateBackend::Local => Box::new(LocalStateStore::new(state_dir, environment, region)),
        StateBackend::S3 { bucket, prefix } => Box::new(S3StateStore::new(
            bucket,
            prefix,
            environment,
            region,
            LocalTransport,
        )),
    }
}

/// Create a new empty StateLock.
pub fn new_lock(stack: &str, environment: &str, region: &str) -> StateLock {
    use crate::tripwire::eventlog::now_iso8601;
    StateLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        environment: environment.to_string(),
        region: region.to_string(),
        generated_at: now_iso8601(),
        generator: format!("stratum {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
    }
}
