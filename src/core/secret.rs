//! Sensitive values.
//!
//! A [`Secret`] keeps its value in zeroizing memory and redacts it from
//! `Debug`. The only way to read the value is [`Secret::expose`], which scopes
//! access to the closure that emits it.

use std::fmt;
use zeroize::Zeroizing;

const FINGERPRINT_CONTEXT: &str = "stratum 2026-10-01 secret fingerprint v1";

/// A keyed value with a sensitivity flag.
#[derive(Clone)]
pub struct Secret {
    key: String,
    value: Zeroizing<String>,
    sensitive: bool,
}

impl Secret {
    /// A sensitive value. Never logged, never persisted.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Zeroizing::new(value.into()),
            sensitive: true,
        }
    }

    /// A value that travels with secrets but may be shown (e.g. a region).
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Zeroizing::new(value.into()),
            sensitive: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    /// Same value under a different key.
    pub fn rekeyed(&self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: self.value.clone(),
            sensitive: self.sensitive,
        }
    }

    /// Run `f` with the raw value.
    pub fn expose<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(self.value.as_str())
    }

    /// Keyed BLAKE3 digest of the value, for change detection only.
    pub fn fingerprint(&self) -> String {
        let key = blake3::derive_key(FINGERPRINT_CONTEXT, self.key.as_bytes());
        let digest = blake3::keyed_hash(&key, self.value.as_bytes());
        format!("blake3:{}", digest.to_hex())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.sensitive == other.sensitive
            && self.value.as_str() == other.value.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.sensitive {
            "***"
        } else {
            self.value.as_str()
        };
        f.debug_struct("Secret")
            .field("key", &self.key)
            .field("value", &shown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_redacts() {
        let s = Secret::new("db_password", "hunter2-hunter2");
        let shown = format!("{:?}", s);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("***"));
        assert!(shown.contains("db_password"));
    }

    #[test]
    fn test_secret_plain_debug_shows_value() {
        let s = Secret::plain("AWS_REGION", "ca-central-1");
        assert!(format!("{:?}", s).contains("ca-central-1"));
        assert!(!s.is_sensitive());
    }

    #[test]
    fn test_secret_expose_scoped() {
        let s = Secret::new("k", "value");
        let len = s.expose(|v| v.len());
        assert_eq!(len, 5);
    }

    #[test]
    fn test_secret_fingerprint_stable_and_value_sensitive() {
        let a = Secret::new("db_password", "one-password");
        let b = Secret::new("db_password", "one-password");
        let c = Secret::new("db_password", "two-password");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.fingerprint().starts_with("blake3:"));
        assert!(!a.fingerprint().contains("one-password"));
    }

    #[test]
    fn test_secret_fingerprint_is_not_plain_hash() {
        let s = Secret::new("k", "abc");
        let plain = format!("blake3:{}", blake3::hash(b"abc").to_hex());
        assert_ne!(s.fingerprint(), plain);
    }

    #[test]
    fn test_secret_rekeyed() {
        let s = Secret::new("secret_access_key", "xyz");
        let r = s.rekeyed("AWS_SECRET_ACCESS_KEY");
        assert_eq!(r.key(), "AWS_SECRET_ACCESS_KEY");
        assert!(r.is_sensitive());
        assert_eq!(r.expose(|v| v.to_string()), "xyz");
    }
}
