//! # Instance Identifiers
//!
//! Every instance and every volume is keyed by an [`InstanceId`] built from
//! an ordered tuple of name parts:
//!
//! ```text
//! (namespace, pod, container)  ──build──▶  "default_web_nginx"
//!                              ◀──split──
//! ```
//!
//! Parts are joined with `_`, a character RFC 1123 names cannot contain, so
//! distinct tuples never collide and `build(split(id)) == id` always holds.
//! Ids are also used verbatim as directory names and as OCI container ids,
//! which is why `/` and control characters are rejected.
//!
//! Volume ids reuse the scheme with the container name replaced by the volume
//! name (see [`InstanceId::with_last`]).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter between name parts.
pub const ID_DELIMITER: char = '_';

/// Deterministic, reversible identifier for an instance or a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Joins name parts into an identifier.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidIdentifier`] if there are no parts, or a part is
    /// empty or contains the delimiter, `/`, or a control character.
    pub fn build<S: AsRef<str>>(parts: &[S]) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::InvalidIdentifier {
                id: String::new(),
                reason: "no name parts".to_string(),
            });
        }

        let joined = parts
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(&ID_DELIMITER.to_string());

        for part in parts {
            check_part(&joined, part.as_ref())?;
        }

        Ok(Self(joined))
    }

    /// Identifier for a container of a pod.
    pub fn from_parts(namespace: &str, pod: &str, container: &str) -> Result<Self> {
        Self::build(&[namespace, pod, container])
    }

    /// Validates an existing identifier string.
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split(ID_DELIMITER).collect();
        Self::build(&parts)
    }

    /// Splits the identifier back into its name parts.
    pub fn split(&self) -> Vec<&str> {
        self.0.split(ID_DELIMITER).collect()
    }

    /// The last name part (container or volume name).
    pub fn name(&self) -> &str {
        self.0.rsplit(ID_DELIMITER).next().unwrap_or(&self.0)
    }

    /// A sibling identifier with the last part replaced.
    ///
    /// Used to derive a volume id from the id of the instance mounting it.
    pub fn with_last(&self, name: &str) -> Result<Self> {
        let mut parts = self.split();
        parts.pop();
        parts.push(name);
        Self::build(&parts)
    }

    /// Borrows the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_part(id: &str, part: &str) -> Result<()> {
    let reason = if part.is_empty() {
        "empty name part"
    } else if part.contains(ID_DELIMITER) {
        "name part contains the delimiter '_'"
    } else if part.contains('/') {
        "name part contains '/'"
    } else if part.chars().any(char::is_control) {
        "name part contains a control character"
    } else {
        return Ok(());
    };

    Err(Error::InvalidIdentifier {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstanceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_split() {
        let id = InstanceId::from_parts("default", "web", "nginx").unwrap();
        assert_eq!(id.as_str(), "default_web_nginx");
        assert_eq!(id.split(), vec!["default", "web", "nginx"]);
        assert_eq!(id.name(), "nginx");
    }

    #[test]
    fn test_rejects_bad_parts() {
        assert!(InstanceId::build::<&str>(&[]).is_err());
        assert!(InstanceId::from_parts("default", "", "nginx").is_err());
        assert!(InstanceId::from_parts("default", "a_b", "nginx").is_err());
        assert!(InstanceId::from_parts("default", "a/b", "nginx").is_err());
        assert!(InstanceId::from_parts("default", "a\nb", "nginx").is_err());
    }

    #[test]
    fn test_with_last() {
        let id = InstanceId::from_parts("default", "web", "nginx").unwrap();
        let vol = id.with_last("data").unwrap();
        assert_eq!(vol.as_str(), "default_web_data");
    }

    #[test]
    fn test_serde_validates() {
        let id: InstanceId = serde_json::from_str("\"ns_pod_c\"").unwrap();
        assert_eq!(id.split().len(), 3);
        assert!(serde_json::from_str::<InstanceId>("\"ns__c\"").is_err());
    }
}
