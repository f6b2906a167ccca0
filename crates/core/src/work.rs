//! Units of work handed from a convergence pass to the execution engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Resolved registry credential.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(registry: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { registry: registry.into(), username: username.into(), password: password.into() }
    }

    /// `user:password` as accepted by `--creds` style flags.
    pub fn to_pair(&self) -> String { format!("{}:{}", self.username, self.password) }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub type Credentials = SmallVec<[Credential; 2]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Pull,
    Remove,
    Copy { destination: String },
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Pull => "pull",
            Operation::Remove => "remove",
            Operation::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub image: String,
    pub operation: Operation,
    /// Candidates in the order they should be tried.
    pub credentials: Credentials,
}

impl WorkItem {
    pub fn pull(image: impl Into<String>, credentials: Credentials) -> Self {
        Self { image: image.into(), operation: Operation::Pull, credentials }
    }

    pub fn remove(image: impl Into<String>) -> Self {
        Self { image: image.into(), operation: Operation::Remove, credentials: Credentials::new() }
    }

    pub fn copy(source: impl Into<String>, destination: impl Into<String>, credentials: Credentials) -> Self {
        Self { image: source.into(), operation: Operation::Copy { destination: destination.into() }, credentials }
    }

    /// Key for per-image exclusion: the destination for copies, the image otherwise.
    pub fn exclusion_key(&self) -> &str {
        match &self.operation {
            Operation::Copy { destination } => destination,
            _ => &self.image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let c = Credential::new("docker.io", "bob", "hunter2");
        let s = format!("{:?}", c);
        assert!(s.contains("bob"));
        assert!(!s.contains("hunter2"));
        assert_eq!(c.to_pair(), "bob:hunter2");
    }

    #[test]
    fn copies_exclude_on_destination() {
        let w = WorkItem::copy("docker.io/library/nginx:1", "mirror:5000/library/nginx:1", Credentials::new());
        assert_eq!(w.exclusion_key(), "mirror:5000/library/nginx:1");
        assert_eq!(WorkItem::remove("a:1").exclusion_key(), "a:1");
    }
}
