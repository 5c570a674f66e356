use std::fmt;
use subtle::ConstantTimeEq;

/// Case-normalized identity key (the registered email).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Trim and lowercase `raw`. Returns `None` for an empty key.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque password credential.
///
/// Stored and compared as given. A real deployment must store a salted hash
/// here instead of the plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for an empty credential.
    pub fn new(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw.to_string()))
        }
    }

    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented password.
    pub fn matches(&self, presented: &str) -> bool {
        bool::from(self.0.as_bytes().ct_eq(presented.as_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_case_normalized() {
        let a = IdentityKey::parse("  A@X.com ").unwrap();
        let b = IdentityKey::parse("a@x.COM").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "a@x.com");
    }

    #[test]
    fn identity_key_rejects_blank() {
        assert!(IdentityKey::parse("").is_none());
        assert!(IdentityKey::parse("   ").is_none());
    }

    #[test]
    fn credential_matches_exactly() {
        let c = Credential::new("hunter2").unwrap();
        assert!(c.matches("hunter2"));
        assert!(!c.matches("hunter3"));
        assert!(!c.matches("hunter22"));
        assert!(!c.matches(""));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("hunter2").unwrap();
        assert!(!format!("{c:?}").contains("hunter2"));
    }

    #[test]
    fn credential_rejects_empty() {
        assert!(Credential::new("").is_none());
    }
}
