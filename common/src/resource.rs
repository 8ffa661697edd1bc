//! Lockable resource identity and request priorities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of banking resource that can be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A customer account.
    #[serde(rename = "CUENTA")]
    Account,
    /// A payment card.
    #[serde(rename = "TARJETA")]
    Card,
}

impl ResourceKind {
    /// Name used on the wire and in canonical keys.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ResourceKind::Account => "CUENTA",
            ResourceKind::Card => "TARJETA",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "CUENTA" => Some(ResourceKind::Account),
            "TARJETA" => Some(ResourceKind::Card),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Canonical identity of a lockable resource.
///
/// Equality, hashing and ordering are by `(kind, id)`. The derived ordering is
/// the canonical acquisition order used by worker clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind.
    #[serde(rename = "tipo")]
    pub kind: ResourceKind,
    /// Resource identifier within its kind.
    pub id: String,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key for an account.
    pub fn account(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Account, id)
    }

    /// Key for a card.
    pub fn card(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Card, id)
    }

    /// Canonical string form `"<tipo>:<id>"`.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.kind.wire_name(), self.id)
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        Some(Self::new(ResourceKind::from_wire(kind)?, id))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.wire_name(), self.id)
    }
}

/// Priority of a lock request. Higher priorities are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(format!("priority must be between 0 and 3, got {}", other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}
