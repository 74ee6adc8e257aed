//! Environment files.
//!
//! One YAML file per deployment target, e.g. `environments/prod.yaml`:
//!
//! ```yaml
//! name: prod
//! region: ca-central-1
//! state:
//!   backend: s3
//!   bucket: agd-terraform-state
//!   prefix: stratum
//! variables:
//!   bucket_name: agd-prod-tyson
//!   db_deletion_protection: true
//!   db_backup_retention_days: 14
//! ```

use super::error::ConfigError;
use super::variables;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::path::{Path, PathBuf};

pub const DEFAULT_REGION: &str = "ca-central-1";

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// Where the state blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StateBackend {
    /// Under the `--state-dir` directory
    #[default]
    Local,

    /// In an S3 object
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
}

/// A deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    pub name: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub state: StateBackend,

    /// Variable overrides for this environment
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
}

impl Environment {
    /// An environment with no file behind it.
    pub fn bare(name: &str) -> Self {
        Self {
            name: name.to_string(),
            region: default_region(),
            state: StateBackend::Local,
            variables: IndexMap::new(),
        }
    }

    /// Variable layer of this environment, with `environment` and `region`
    /// filled in from the file's own fields.
    pub fn layer(&self) -> IndexMap<String, Value> {
        let mut layer = self.variables.clone();
        layer.insert("environment".to_string(), Value::String(self.name.clone()));
        layer
            .entry("region".to_string())
            .or_insert_with(|| Value::String(self.region.clone()));
        layer
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse an environment from a string.
pub fn parse_environment(yaml: &str, path: &Path) -> Result<Environment, ConfigError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Default file location of an environment.
pub fn environment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.yaml", name))
}

/// Load the environment `name`.
///
/// With `explicit_file`, that file must exist. Otherwise `<dir>/<name>.yaml`
/// is read if present, and a bare environment is returned if not.
pub fn load_environment(
    dir: &Path,
    name: &str,
    explicit_file: Option<&Path>,
) -> Result<Environment, ConfigError> {
    let path = match explicit_file {
        Some(p) => p.to_path_buf(),
        None => {
            let p = environment_path(dir, name);
            if !p.exists() {
                tracing::debug!(path = %p.display(), "no environment file, using defaults");
                return Ok(Environment::bare(name));
            }
            p
        }
    };

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let env = parse_environment(&content, &path)?;

    let errors = validate_environment(&env, name);
    if !errors.is_empty() {
        return Err(ConfigError::InvalidEnvironment {
            name: name.to_string(),
            reasons: errors.iter().map(|e| e.to_string()).collect(),
        });
    }
    Ok(env)
}

/// Validate a parsed environment. Returns a list of errors (empty = valid).
pub fn validate_environment(env: &Environment, expected_name: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if env.name != expected_name {
        errors.push(ValidationError {
            message: format!(
                "file declares environment '{}' but '{}' was selected",
                env.name, expected_name
            ),
        });
    }

    if env.region.is_empty() {
        errors.push(ValidationError {
            message: "region must not be empty".to_string(),
        });
    }

    for key in env.variables.keys() {
        if variables::lookup(key).is_none() {
            errors.push(ValidationError {
                message: format!("unknown variable '{}'", key),
            });
        }
        if key == "environment" {
            errors.push(ValidationError {
                message: "set the environment with 'name', not a variable".to_string(),
            });
        }
        if key == "db_password" || key == "db_app_password" {
            errors.push(ValidationError {
                message: format!("'{}' must not be stored in an environment file", key),
            });
        }
    }

    if let StateBackend::S3 { bucket, .. } = &env.state {
        if let Err(reason) = variables::validate_bucket_name(bucket) {
            errors.push(ValidationError {
                message: format!("state bucket: {}", reason),
            });
        }
    }

    errors
}

/// Scaffold text for `init`.
pub fn scaffold(name: &str, region: &str) -> String {
    format!(
        "name: {name}\n\
         region: {region}\n\
         state:\n  backend: local\n\
         variables:\n\
         \x20 bucket_name: agd-{name}-tyson\n\
         \x20 allowed_db_cidr_blocks:\n\
         \x20   - 10.0.0.0/16\n\
         \x20 db_deletion_protection: false\n\
         \x20 db_backup_retention_days: 7\n\
         \x20 s3_versioning: true\n\
         \x20 s3_force_destroy: false\n\
         \x20 db_publicly_accessible: false\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_full() {
        let yaml = r#"
name: prod
region: us-east-1
state:
  backend: s3
  bucket: agd-state
  prefix: stratum
variables:
  bucket_name: agd-prod-tyson
  db_deletion_protection: true
"#;
        let env = parse_environment(yaml, Path::new("prod.yaml")).unwrap();
        assert_eq!(env.region, "us-east-1");
        assert_eq!(
            env.state,
            StateBackend::S3 {
                bucket: "agd-state".to_string(),
                prefix: "stratum".to_string()
            }
        );
        assert!(validate_environment(&env, "prod").is_empty());
        let layer = env.layer();
        assert_eq!(layer["environment"], Value::String("prod".into()));
        assert_eq!(layer["region"], Value::String("us-east-1".into()));
    }

    #[test]
    fn test_environment_defaults() {
        let env = parse_environment("name: dev\n", Path::new("dev.yaml")).unwrap();
        assert_eq!(env.region, DEFAULT_REGION);
        assert_eq!(env.state, StateBackend::Local);
    }

    #[test]
    fn test_environment_rejects_unknown_field() {
        let err = parse_environment("name: dev\nregoin: x\n", Path::new("dev.yaml"));
        assert!(matches!(err, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_environment_validate_errors() {
        let yaml = "name: dev\nvariables:\n  db_password: nope\n  bogus: 1\n";
        let env = parse_environment(yaml, Path::new("x.yaml")).unwrap();
        let errors = validate_environment(&env, "prod");
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_environment_missing_default_file_is_bare() {
        let dir = tempfile::tempdir().unwrap();
        let env = load_environment(dir.path(), "dev", None).unwrap();
        assert_eq!(env.name, "dev");
        assert!(env.variables.is_empty());
    }

    #[test]
    fn test_environment_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = load_environment(dir.path(), "dev", Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_environment_scaffold_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(environment_path(dir.path(), "staging"), scaffold("staging", "ca-central-1"))
            .unwrap();
        let env = load_environment(dir.path(), "staging", None).unwrap();
        assert_eq!(env.variables["bucket_name"], Value::String("agd-staging-tyson".into()));
    }
}
