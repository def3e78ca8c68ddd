//! Identifiers for the supervised services
//!
//! The set of services is closed: every backend the gateway fronts is listed
//! here, in the order they are booted.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A supervised backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    /// Embedded database (prerequisite for the API)
    Database,
    /// Backend REST API
    Api,
    /// Messaging bridge to the external chat networks
    Bridge,
    /// Bot-session manager (one local socket per session)
    Sessions,
    /// Development UI server
    DevUi,
}

impl ServiceId {
    /// All services in boot order
    pub const ALL: [ServiceId; 5] = [
        ServiceId::Database,
        ServiceId::Api,
        ServiceId::Bridge,
        ServiceId::Sessions,
        ServiceId::DevUi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Database => "database",
            ServiceId::Api => "api",
            ServiceId::Bridge => "bridge",
            ServiceId::Sessions => "sessions",
            ServiceId::DevUi => "devui",
        }
    }

    /// Prefix used for per-service environment overrides (`SWITCHBOARD_API_PORT`, ...)
    pub fn env_prefix(&self) -> String {
        format!("SWITCHBOARD_{}", self.as_str().to_uppercase())
    }

    /// Default loopback port range `(start, end)`, inclusive
    pub fn default_port_range(&self) -> (u16, u16) {
        match self {
            ServiceId::Api => (4100, 4109),
            ServiceId::Bridge => (4110, 4119),
            ServiceId::Sessions => (4120, 4129),
            ServiceId::DevUi => (4130, 4139),
            ServiceId::Database => (4140, 4149),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown service name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service '{0}'")]
pub struct UnknownServiceName(pub String);

impl FromStr for ServiceId {
    type Err = UnknownServiceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(ServiceId::Database),
            "api" => Ok(ServiceId::Api),
            "bridge" => Ok(ServiceId::Bridge),
            "sessions" => Ok(ServiceId::Sessions),
            "devui" | "dev-ui" | "ui" => Ok(ServiceId::DevUi),
            other => Err(UnknownServiceName(other.to_string())),
        }
    }
}
