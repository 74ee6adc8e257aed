//! External secret stores.
//!
//! An external secret's payload is every `env.`-prefixed attribute of its
//! spec, resolved. Values are pushed as one JSON object over stdin.

pub mod memory;
pub mod modal;

pub use memory::MemorySecretStore;
pub use modal::ModalSecretStore;

use crate::core::secret::Secret;
use crate::core::types::{AttrValue, ResourceSpec};
use crate::resources::modal::PAYLOAD_PREFIX;
use crate::tripwire::hasher::composite_hash;

/// A place credentials are forwarded to.
pub trait SecretStore {
    fn name(&self) -> &str;

    /// Create or overwrite the secret `name` with `payload`.
    fn push(&mut self, name: &str, payload: &[Secret]) -> Result<(), String>;

    /// Remove the secret `name`. Absent secrets are not an error.
    fn delete(&mut self, name: &str) -> Result<(), String>;
}

/// Payload entries of a resolved external-secret spec, in attribute order.
pub fn payload(spec: &ResourceSpec) -> Result<Vec<Secret>, String> {
    spec.attributes
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(PAYLOAD_PREFIX).map(|key| (key, v)))
        .map(|(key, value)| match value {
            AttrValue::Secret(s) => Ok(s.rekeyed(key)),
            AttrValue::Ref(r) => Err(format!("{} is unresolved ({})", key, r)),
            other => Ok(Secret::plain(key, other.recordable().unwrap_or_default())),
        })
        .collect()
}

/// Fingerprint of the resolved payload. A push is due when it changes.
pub fn trigger(spec: &ResourceSpec) -> String {
    let components: Vec<String> = spec
        .attributes
        .iter()
        .filter(|(k, _)| k.starts_with(PAYLOAD_PREFIX))
        .map(|(k, v)| format!("{}={}", k, v.hash_component()))
        .collect();
    let refs: Vec<&str> = components.iter().map(String::as_str).collect();
    composite_hash(&refs)
}

/// Payload as a JSON object, kept in a zeroizing buffer.
pub fn payload_json(payload: &[Secret]) -> zeroize::Zeroizing<String> {
    let mut map = serde_json::Map::new();
    for entry in payload {
        entry.expose(|v| map.insert(entry.key().to_string(), v.into()));
    }
    let json = serde_json::Value::Object(map).to_string();
    zeroize::Zeroizing::new(json)
}
