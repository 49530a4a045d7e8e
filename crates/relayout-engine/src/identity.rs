//! Type identity
//!
//! A type is identified by its qualified name together with the loader that
//! defined it. Two loaders may define unrelated types with the same name, so
//! equality is never by name alone.

use std::fmt;

/// Identity of a loader
///
/// Ids are allocated by the host when a loader is created. Id 0 is reserved
/// for the bootstrap loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub u64);

impl LoaderId {
    /// The bootstrap loader
    pub const BOOTSTRAP: LoaderId = LoaderId(0);

    /// Whether this is the bootstrap loader
    pub fn is_bootstrap(self) -> bool {
        self == Self::BOOTSTRAP
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bootstrap() {
            f.write_str("bootstrap")
        } else {
            write!(f, "loader#{}", self.0)
        }
    }
}

/// (qualified name, owning loader)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdentifier {
    name: String,
    loader: LoaderId,
}

impl TypeIdentifier {
    /// Create an identifier for a type defined by `loader`
    pub fn new(name: impl Into<String>, loader: LoaderId) -> Self {
        Self {
            name: name.into(),
            loader,
        }
    }

    /// Create an identifier for a bootstrap type
    pub fn bootstrap(name: impl Into<String>) -> Self {
        Self::new(name, LoaderId::BOOTSTRAP)
    }

    /// Qualified (internal) type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defining loader
    pub fn loader(&self) -> LoaderId {
        self.loader
    }
}

impl fmt::Display for TypeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.loader)
    }
}
