//! Service signatures.

use std::fmt;

use papaya::Equivalent;
use serde_with::SerializeDisplay;

/// A `(service, environment)` pair identifying a class of traffic.
///
/// The empty signature (no service, no environment) is used as the key of the default rate when publishing rates.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, SerializeDisplay)]
pub struct ServiceSignature {
    name: String,
    env: String,
}

impl ServiceSignature {
    /// Creates a new `ServiceSignature`.
    pub fn new(name: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: env.into(),
        }
    }

    /// Returns the service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the environment.
    pub fn env(&self) -> &str {
        &self.env
    }
}

impl fmt::Display for ServiceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service:{},env:{}", self.name, self.env)
    }
}

/// Borrowed form of a [`ServiceSignature`], for lookups that should not allocate.
///
/// Hashes identically to the owned signature with the same name and environment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ServiceSignatureRef<'a> {
    name: &'a str,
    env: &'a str,
}

impl<'a> ServiceSignatureRef<'a> {
    pub fn new(name: &'a str, env: &'a str) -> Self {
        Self { name, env }
    }

    pub fn into_owned(self) -> ServiceSignature {
        ServiceSignature::new(self.name, self.env)
    }
}

impl Equivalent<ServiceSignature> for ServiceSignatureRef<'_> {
    fn equivalent(&self, key: &ServiceSignature) -> bool {
        self.name == key.name && self.env == key.env
    }
}

/// Compact identifier assigned to a [`ServiceSignature`] by a catalog.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Signature(pub(crate) u64);

impl Signature {
    /// Returns the raw identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}
