// Numan Thabit 2025
//! Private endpoints the dispatcher calls on servicer nodes.

use serde::{Deserialize, Serialize};

use crate::error::ServicerError;
use crate::relay::{RelayMeta, SessionHeader};

pub const RELAY_PATH: &str = "/v1/private/mesh/relay";
pub const SESSION_PATH: &str = "/v1/private/mesh/session";
pub const CHECK_PATH: &str = "/v1/private/mesh/check";

/// Header naming the servicer address a notification belongs to.
pub const SERVICER_HEADER: &str = "X-Servicer";

/// Paths probed for first-time connectivity.
pub const PROBE_PATHS: [&str; 3] = [RELAY_PATH, SESSION_PATH, CHECK_PATH];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSession {
    pub header: SessionHeader,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Servicer-authoritative view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Dispatch {
    #[serde(default)]
    pub block_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<DispatchSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRequest {
    pub session_header: SessionHeader,
    pub meta: RelayMeta,
    pub servicer_pub_key: String,
    pub blockchain: String,
    pub session_block_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<ServicerError>,
    #[serde(default)]
    pub dispatch: Option<Dispatch>,
    #[serde(default)]
    pub remaining_relays: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<ServicerError>,
    #[serde(default)]
    pub dispatch: Option<Dispatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckRequest {
    pub servicers: Vec<String>,
    pub chains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    pub height: u64,
    #[serde(default)]
    pub is_starting: bool,
    #[serde(default)]
    pub is_catching_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<ServicerError>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub blocks_per_session: u64,
    #[serde(default)]
    pub wrong_servicers: Vec<String>,
    #[serde(default)]
    pub wrong_chains: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_uses_servicer_field_names() {
        let raw = r#"{"success":true,"status":{"Height":12,"IsStarting":false,"IsCatchingUp":true},"blocks_per_session":4}"#;
        let parsed: CheckResponse = serde_json::from_str(raw).unwrap();
        let status = parsed.status.expect("status present");
        assert_eq!(status.height, 12);
        assert!(status.is_catching_up);
        assert_eq!(parsed.blocks_per_session, 4);
        assert!(parsed.wrong_chains.is_empty());
    }

    #[test]
    fn session_request_is_pascal_case() {
        let request = SessionRequest {
            session_header: SessionHeader {
                app_public_key: "aa".into(),
                chain: "0001".into(),
                session_height: 9,
            },
            meta: RelayMeta { block_height: 9 },
            servicer_pub_key: "bb".into(),
            blockchain: "0001".into(),
            session_block_height: 9,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["SessionBlockHeight"], 9);
        assert_eq!(json["SessionHeader"]["chain"], "0001");
    }
}
