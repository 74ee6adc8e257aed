//! Modal secret store, driven by the `modal` CLI.

use super::{payload_json, SecretStore};
use crate::core::codegen::quote;
use crate::core::secret::Secret;
use crate::resources::{guarded, heredoc};
use crate::transport::{LocalTransport, Transport};
use zeroize::Zeroizing;

pub struct ModalSecretStore<T: Transport = LocalTransport> {
    transport: T,
}

impl<T: Transport> ModalSecretStore<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl Default for ModalSecretStore<LocalTransport> {
    fn default() -> Self {
        Self::new(LocalTransport)
    }
}

/// `modal secret create` reading the payload from stdin.
pub fn push_script(name: &str, payload: &[Secret]) -> Zeroizing<String> {
    let json = payload_json(payload);
    Zeroizing::new(format!(
        "set -euo pipefail\nmodal secret create {} --force --from-json /dev/stdin >/dev/null {}",
        quote(name),
        heredoc("STRATUM_SECRET", &json)
    ))
}

/// `modal secret delete`, succeeding when the secret is already gone.
pub fn delete_script(name: &str) -> String {
    let cmd = format!("modal secret delete {} --yes", quote(name));
    format!(
        "set -uo pipefail\n{}",
        guarded(&cmd, &["not found", "NotFound"], ":")
    )
}

impl<T: Transport> SecretStore for ModalSecretStore<T> {
    fn name(&self) -> &str {
        "modal"
    }

    fn push(&mut self, name: &str, payload: &[Secret]) -> Result<(), String> {
        let script = push_script(name, payload);
        let out = self.transport.exec(&script)?;
        if !out.success() {
            return Err(out.error_message());
        }
        tracing::debug!(secret = name, entries = payload.len(), "modal secret written");
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<(), String> {
        let out = self.transport.exec(&delete_script(name))?;
        if !out.success() {
            return Err(out.error_message());
        }
        tracing::debug!(secret = name, "modal secret deleted");
        Ok(())
    }
}
