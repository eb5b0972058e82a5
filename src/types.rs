//! Secure types for handling sensitive data.
//!
//! Root tokens, scoped driver tokens and secret values pass through logs,
//! reports and `plan` output. [`SecretString`] keeps them out of all three.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A string wrapper that redacts its contents in Debug, Display, and serialization.
///
/// - Debug output shows `SecretString([REDACTED])`
/// - Display output shows `[REDACTED]`
/// - Serialization outputs `"[REDACTED]"`
/// - Memory is zeroed when dropped
///
/// The actual value is only reachable through [`SecretString::expose_secret`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SecretString(value))
    }
}

impl SecretString {
    /// Creates a new SecretString from a string value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the underlying secret value.
    ///
    /// Only call this at the boundary where the value is handed to the backend,
    /// the driver settings, or a byte comparison. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Returns the length of the secret without exposing the value.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_redacts_debug_and_display() {
        let secret = SecretString::new("root-token-value");

        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_secret_string_expose() {
        let secret = SecretString::new("smoke_test_value_123");
        assert_eq!(secret.expose_secret(), "smoke_test_value_123");
        assert_eq!(secret.len(), 20);
        assert!(!secret.is_empty());
    }

    #[test]
    fn test_secret_string_not_in_struct_json() {
        #[derive(Serialize)]
        struct Session {
            address: String,
            root_token: SecretString,
        }

        let session = Session {
            address: "http://127.0.0.1:8200".to_string(),
            root_token: SecretString::new("hidden-root"),
        };

        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("127.0.0.1:8200"));
        assert!(json.contains("[REDACTED]"));
        assert!(!json.contains("hidden-root"));
    }

    #[test]
    fn test_secret_string_deserialization_accepts_values() {
        let secret: SecretString = serde_json::from_str("\"actual\"").unwrap();
        assert_eq!(secret.expose_secret(), "actual");
    }
}
