//! The namespace prefix that isolates one queue or scheduler's key family.

use std::fmt;

use smol_str::SmolStr;

use crate::error::DqError;

/// A short, non-empty prefix isolating one queue or scheduler's key
/// family from every other namespace sharing the same Redis database.
///
/// Validated once at construction so that every downstream key built
/// from it is guaranteed non-degenerate.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Namespace(SmolStr);

impl Namespace {
    /// Validates and wraps a namespace string.
    ///
    /// # Errors
    ///
    /// Returns [`DqError::Config`] if `value` is empty.
    pub fn new(value: impl Into<SmolStr>) -> Result<Self, DqError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DqError::config("namespace must not be empty"));
        }
        Ok(Self(value))
    }

    /// Returns the namespace as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Namespace {
    type Error = DqError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for Namespace {
    type Error = DqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_namespace() {
        assert!(Namespace::new("").is_err());
    }

    #[test]
    fn accepts_non_empty_namespace() {
        let ns = Namespace::new("stuff").unwrap();
        assert_eq!(ns.as_str(), "stuff");
        assert_eq!(ns.to_string(), "stuff");
    }
}
