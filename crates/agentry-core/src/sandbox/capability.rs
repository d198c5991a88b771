//! Sandbox capabilities: the permission axis for stored functions.
//!
//! Each capability names one module of host functionality. Code may only
//! import modules whose capability appears in the function's allow-list.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A module of host functionality that sandboxed code can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Numeric helpers (`math.floor`, `math.sqrt`, …).
    Math,
    /// Wall clock and sleeping (`time.now`, `time.sleep`).
    Time,
    /// Structured log lines (`log.info`, `log.warn`).
    Log,
    /// File access. Only callable when the host installs a provider.
    Fs,
    /// Network access. Only callable when the host installs a provider.
    Net,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Math,
        Capability::Time,
        Capability::Log,
        Capability::Fs,
        Capability::Net,
    ];

    /// Module name as written in code (`import time;`).
    pub fn module(&self) -> &'static str {
        match self {
            Capability::Math => "math",
            Capability::Time => "time",
            Capability::Log => "log",
            Capability::Fs => "fs",
            Capability::Net => "net",
        }
    }

    /// Whether the sandbox implements this module itself.
    pub fn is_builtin(&self) -> bool {
        matches!(self, Capability::Math | Capability::Time | Capability::Log)
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.module() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.module())
    }
}
