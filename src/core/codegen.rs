//! Script generation: dispatch to resource modules, parse their output.
//!
//! Each resource kind produces up to five scripts:
//! - read: print the remote object as JSON, or nothing if it is absent
//! - create / update: converge and print outputs as JSON
//! - delete: remove the object recorded in state
//! - probe: check that the object's backing service is reachable
//!
//! Scripts that may carry secrets are returned in zeroizing buffers.

use super::secret::Secret;
use super::types::{AttrValue, Outputs, RecordedOutputs, ResourceKind, ResourceLock, ResourceSpec};
use crate::resources;
use zeroize::Zeroizing;

/// Output keys whose values are sensitive.
const SENSITIVE_OUTPUTS: &[&str] = &["secret_access_key"];

/// Single-quote a value for bash.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn unsupported(kind: ResourceKind, what: &str) -> String {
    format!("{} has no {} script", kind, what)
}

/// Generate a read script for a resource.
pub fn read_script(spec: &ResourceSpec) -> Result<Zeroizing<String>, String> {
    let script = match spec.kind {
        ResourceKind::SecurityGroup => resources::security::read_script(spec),
        ResourceKind::DatabaseInstance => resources::rds::read_script(spec),
        ResourceKind::Bucket => resources::s3::read_script(spec),
        ResourceKind::IamPolicy => resources::iam::policy_read_script(spec),
        ResourceKind::IamUser => resources::iam::user_read_script(spec),
        ResourceKind::IamAccessKey => resources::iam::key_read_script(spec),
        ResourceKind::DatabaseRole => resources::postgres::read_script(spec),
        ResourceKind::ExternalSecret => return Err(unsupported(spec.kind, "read")),
    };
    Ok(Zeroizing::new(script))
}

/// Generate a create script for a resource.
pub fn create_script(spec: &ResourceSpec) -> Result<Zeroizing<String>, String> {
    let script = match spec.kind {
        ResourceKind::SecurityGroup => resources::security::create_script(spec),
        ResourceKind::DatabaseInstance => resources::rds::create_script(spec),
        ResourceKind::Bucket => resources::s3::create_script(spec),
        ResourceKind::IamPolicy => resources::iam::policy_create_script(spec),
        ResourceKind::IamUser => resources::iam::user_create_script(spec),
        ResourceKind::IamAccessKey => resources::iam::key_create_script(spec),
        ResourceKind::DatabaseRole => resources::postgres::apply_script(spec),
        ResourceKind::ExternalSecret => return Err(unsupported(spec.kind, "create")),
    };
    Ok(Zeroizing::new(script))
}

/// Generate an update script for a resource, given its recorded outputs.
pub fn update_script(
    spec: &ResourceSpec,
    prior: &RecordedOutputs,
) -> Result<Zeroizing<String>, String> {
    let script = match spec.kind {
        ResourceKind::SecurityGroup => resources::security::update_script(spec, prior),
        ResourceKind::DatabaseInstance => resources::rds::update_script(spec, prior),
        ResourceKind::Bucket => resources::s3::update_script(spec),
        ResourceKind::IamPolicy => resources::iam::policy_update_script(spec, prior),
        ResourceKind::IamUser => resources::iam::user_update_script(spec),
        ResourceKind::IamAccessKey => resources::iam::key_rotate_script(spec),
        ResourceKind::DatabaseRole => resources::postgres::apply_script(spec),
        ResourceKind::ExternalSecret => return Err(unsupported(spec.kind, "update")),
    };
    Ok(Zeroizing::new(script))
}

/// Generate a delete script. `None` means removal is state-only.
pub fn delete_script(lock: &ResourceLock) -> Option<String> {
    match lock.kind {
        ResourceKind::SecurityGroup => Some(resources::security::delete_script(lock)),
        ResourceKind::DatabaseInstance => Some(resources::rds::delete_script(lock)),
        ResourceKind::Bucket => Some(resources::s3::delete_script(lock)),
        ResourceKind::IamPolicy => Some(resources::iam::policy_delete_script(lock)),
        ResourceKind::IamUser => Some(resources::iam::user_delete_script(lock)),
        ResourceKind::IamAccessKey => Some(resources::iam::key_delete_script(lock)),
        // The role lives inside the instance; the instance's deletion removes it.
        ResourceKind::DatabaseRole => None,
        // Removed through the secret store.
        ResourceKind::ExternalSecret => None,
    }
}

/// Generate a reachability probe. `None` if the kind needs none.
pub fn probe_script(spec: &ResourceSpec) -> Option<Zeroizing<String>> {
    match spec.kind {
        ResourceKind::DatabaseRole => Some(Zeroizing::new(resources::postgres::probe_script(spec))),
        _ => None,
    }
}

/// Parse the JSON a read script printed. Empty output or `null` means absent.
pub fn parse_read(stdout: &str) -> Result<Option<RecordedOutputs>, String> {
    match parse_json_object(stdout)? {
        None => Ok(None),
        Some(map) => Ok(Some(
            map.into_iter()
                .filter(|(k, _)| !SENSITIVE_OUTPUTS.contains(&k.as_str()))
                .map(|(k, v)| (k, json_text(&v)))
                .collect(),
        )),
    }
}

/// Parse the JSON a create/update script printed into outputs.
/// Sensitive keys become [`AttrValue::Secret`].
pub fn parse_outputs(stdout: &str) -> Result<Outputs, String> {
    let map = parse_json_object(stdout)?.ok_or_else(|| "script printed no outputs".to_string())?;
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let text = json_text(&v);
            let value = if SENSITIVE_OUTPUTS.contains(&k.as_str()) {
                AttrValue::Secret(Secret::new(k.clone(), text))
            } else {
                AttrValue::Str(text)
            };
            (k, value)
        })
        .collect())
}

/// The recordable (non-sensitive) part of outputs.
pub fn recordable_outputs(outputs: &Outputs) -> RecordedOutputs {
    outputs
        .iter()
        .filter_map(|(k, v)| v.recordable().map(|text| (k.clone(), text)))
        .collect()
}

fn parse_json_object(
    stdout: &str,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    // Tools may print progress before the final JSON document.
    let candidate = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(v) => v,
        Err(_) => trailing_json(trimmed).ok_or_else(|| "output is not JSON".to_string())?,
    };
    match candidate {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => Err(format!("expected a JSON object, got {}", other)),
    }
}

/// The last `{`-led line from which the rest of the text parses as JSON.
fn trailing_json(text: &str) -> Option<serde_json::Value> {
    let starts: Vec<usize> = text
        .match_indices('\n')
        .map(|(i, _)| i + 1)
        .filter(|&i| text[i..].starts_with('{'))
        .collect();
    starts
        .into_iter()
        .rev()
        .find_map(|i| serde_json::from_str(&text[i..]).ok())
}

fn json_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
