//! NAT descriptor types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse NAT category used to decide whether a direct path is worth trying
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReachabilityClass {
    /// Not behind a NAT (or on the same host as the relay)
    None,
    Cone,
    Symmetric,
    Unknown,
}

impl ReachabilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReachabilityClass::None => "none",
            ReachabilityClass::Cone => "cone",
            ReachabilityClass::Symmetric => "symmetric",
            ReachabilityClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ReachabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the relay knows about a peer's NAT situation
///
/// Produced once by an address classifier and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NatDescriptor {
    #[serde(rename = "type")]
    pub reachability_class: ReachabilityClass,
    #[serde(rename = "publicIP")]
    pub public_address: Option<String>,
}

impl NatDescriptor {
    pub fn new(reachability_class: ReachabilityClass, public_address: Option<String>) -> Self {
        Self {
            reachability_class,
            public_address,
        }
    }

    pub fn unknown() -> Self {
        Self::new(ReachabilityClass::Unknown, None)
    }
}
