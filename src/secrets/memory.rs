//! In-memory secret store recording every push.

use super::SecretStore;
use crate::core::secret::Secret;

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    pushes: Vec<(String, Vec<Secret>)>,
    deleted: Vec<String>,
    fail_next: usize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` pushes.
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    /// Every accepted push, oldest first.
    pub fn pushes(&self) -> &[(String, Vec<Secret>)] {
        &self.pushes
    }

    /// Names deleted, oldest first.
    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    /// Latest value of `key` pushed under `name`.
    pub fn latest(&self, name: &str, key: &str) -> Option<String> {
        self.pushes
            .iter()
            .rev()
            .filter(|(n, _)| n == name)
            .flat_map(|(_, payload)| payload.iter())
            .find(|s| s.key() == key)
            .map(|s| s.expose(str::to_string))
    }
}

impl SecretStore for MemorySecretStore {
    fn name(&self) -> &str {
        "modal"
    }

    fn push(&mut self, name: &str, payload: &[Secret]) -> Result<(), String> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err("Error: Not authenticated".to_string());
        }
        self.pushes.push((name.to_string(), payload.to_vec()));
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<(), String> {
        self.deleted.push(name.to_string());
        Ok(())
    }
}
