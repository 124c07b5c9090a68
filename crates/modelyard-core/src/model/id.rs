//! Model identifier parsing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `namespace/name` model identifier. A bare name implies the `default`
/// namespace. Identifiers are the unique catalog key; ordering is lexical
/// on `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelId {
    namespace: String,
    name: String,
}

#[derive(Debug, Clone)]
pub struct ParseModelIdError {
    input: String,
}

impl fmt::Display for ParseModelIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid model identifier: '{}'", self.input)
    }
}

impl std::error::Error for ParseModelIdError {}

impl ModelId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relative directory for this identifier under a models root.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.namespace).join(&self.name)
    }
}

impl FromStr for ModelId {
    type Err = ParseModelIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let err = || ParseModelIdError {
            input: input.to_string(),
        };
        if trimmed.is_empty() {
            return Err(err());
        }
        match trimmed.split_once('/') {
            None => Ok(Self::new("default", trimmed)),
            Some((ns, name)) => {
                if ns.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(err());
                }
                Ok(Self::new(ns, name))
            }
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_default_namespace() {
        let id: ModelId = "standalone-model".parse().unwrap();
        assert_eq!(id.namespace(), "default");
        assert_eq!(id.name(), "standalone-model");
        assert_eq!(id.to_string(), "default/standalone-model");
    }

    #[test]
    fn two_segment_identifier() {
        let id: ModelId = "mistralai/mistral-7b".parse().unwrap();
        assert_eq!(id.namespace(), "mistralai");
        assert_eq!(id.rel_path(), PathBuf::from("mistralai/mistral-7b"));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!("".parse::<ModelId>().is_err());
        assert!("/name".parse::<ModelId>().is_err());
        assert!("ns/".parse::<ModelId>().is_err());
        assert!("a/b/c".parse::<ModelId>().is_err());
    }
}
