//! Capability grants for task types.
//!
//! An agent's identity lists the operation kinds it may perform. The
//! scheduler consults the set on every `submit_task`: a task whose type is
//! not granted is refused before it ever reaches the queue. Grants are fixed
//! at identity construction and never elevated at runtime.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single permitted operation kind.
///
/// Names are matched exactly against `Task::task_type`, e.g. "scan:model",
/// "score:risk", "audit:append". The name `*` grants every task type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability(pub String);

impl Capability {
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// The set of operation kinds granted to one agent.
///
/// An empty set declares no restrictions. Once any capability is granted the
/// set becomes an allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    inner: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn grant(&mut self, capability: Capability) {
        self.inner.insert(capability);
    }

    pub fn has(&self, capability: &Capability) -> bool {
        self.inner.contains(capability)
    }

    /// Return true if a task of type `operation` may run under this set.
    pub fn permits(&self, operation: &str) -> bool {
        self.inner.is_empty()
            || self
                .inner
                .iter()
                .any(|c| c.is_wildcard() || c.0 == operation)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Iterate granted capabilities in name order.
    pub fn all(&self) -> impl Iterator<Item = &Capability> {
        self.inner.iter()
    }
}

impl<C: Into<Capability>> FromIterator<C> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().map(Into::into).collect(),
        }
    }
}
