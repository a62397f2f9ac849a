//! Small domain primitives shared across the workspace

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Transport a DNS query arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
        }
    }
}

/// Origin of a DNS query: transport plus peer address.
#[derive(Debug, Clone, Copy)]
pub struct QuerySource {
    pub proto: Proto,
    pub address: IpAddr,
    pub port: u16,
}

/// Last known health of a probed endpoint, as persisted in the store.
///
/// `status` flips between probe cycles; `error`/`code` carry the detail of
/// the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl HealthState {
    pub fn up() -> Self {
        Self {
            status: true,
            error: None,
            code: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            status: false,
            error: Some(error.into()),
            code: None,
        }
    }

    pub fn down_with_code(error: impl Into<String>, code: u16) -> Self {
        Self {
            status: false,
            error: Some(error.into()),
            code: Some(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_roundtrip() {
        let state = HealthState::down_with_code("connection refused", 502);
        let json = serde_json::to_string(&state).unwrap();
        let back: HealthState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_health_state_up_omits_detail() {
        let json = serde_json::to_string(&HealthState::up()).unwrap();
        assert_eq!(json, r#"{"status":true}"#);
    }
}
