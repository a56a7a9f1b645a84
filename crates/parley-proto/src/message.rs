//! Broker message definitions.

use crate::error::{ProtoError, Result};
use crate::negotiation::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// Host advertisement, attached to a listening peer and echoed in list responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerData {
    /// Alias of the listening peer (stamped by the relay)
    pub alias: String,
    /// Human-readable server name
    pub name: String,
    /// Application protocol tag
    pub protocol: Option<String>,
    /// JSON-encoded application metadata
    pub meta: Option<String>,
}

/// Kind of negotiation payload carried by a [`WebRtcMessage`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NegotiationKind {
    /// A single connectivity candidate (or the end-of-candidates marker)
    Candidate,
    /// An offer or answer session description
    Session,
}

impl std::fmt::Display for NegotiationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate => write!(f, "candidate"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Negotiation message routed between two sub-connections
///
/// The relay only looks at `sender` and `receiver`; `json` is opaque to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebRtcMessage {
    /// Payload kind
    pub kind: NegotiationKind,
    /// Socket id of the sending sub-connection
    pub sender: String,
    /// Socket id of the receiving sub-connection
    pub receiver: String,
    /// JSON payload
    pub json: String,
}

impl WebRtcMessage {
    /// Build a candidate message; `None` encodes the end-of-candidates marker
    ///
    /// # Errors
    ///
    /// Returns an error if the candidate cannot be encoded as JSON.
    pub fn candidate(sender: &str, receiver: &str, candidate: Option<&IceCandidate>) -> Result<Self> {
        Ok(Self {
            kind: NegotiationKind::Candidate,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            json: serde_json::to_string(&candidate)?,
        })
    }

    /// Build a session message carrying an offer or answer
    ///
    /// # Errors
    ///
    /// Returns an error if the description cannot be encoded as JSON.
    pub fn session(sender: &str, receiver: &str, description: &SessionDescription) -> Result<Self> {
        Ok(Self {
            kind: NegotiationKind::Session,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            json: serde_json::to_string(description)?,
        })
    }

    /// Decode the candidate payload. `Ok(None)` is the end-of-candidates marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a candidate or `null`.
    pub fn parse_candidate(&self) -> Result<Option<IceCandidate>> {
        Ok(serde_json::from_str(&self.json)?)
    }

    /// Decode the session payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a session description of a known type.
    pub fn parse_session(&self) -> Result<SessionDescription> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

/// Messages exchanged over a relay connection
///
/// Exactly one variant is present per frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerMessage {
    /// Relay tells a freshly accepted connection its alias
    Welcome {
        /// Assigned alias
        alias: String,
    },

    /// Latency probe
    Ping,

    /// Latency probe response
    Pong,

    /// A sub-connection asks a host to pair with it
    ServerSyn {
        /// Socket id of the connecting sub-connection
        sender: String,
        /// Alias of the target host
        server_alias: String,
    },

    /// A host answers a syn with the socket id of its new sub-connection
    ServerSynAck {
        /// Socket id of the host's new sub-connection
        sender: String,
        /// Socket id of the connecting sub-connection
        receiver: String,
    },

    /// Register the sending connection as a host
    CreateServerRequest {
        /// Alias claimed by the client (the relay overrides it)
        alias: String,
        /// Host advertisement
        server_data: Option<ServerData>,
    },

    /// Host registration succeeded
    CreateServerResponse {
        /// Alias the host was registered under
        alias: String,
    },

    /// Ask for the registered hosts
    ServerListRequest {
        /// Optional application protocol filter
        protocol: Option<String>,
    },

    /// Registered hosts
    ServerListResponse {
        /// Host advertisements
        servers: Vec<ServerData>,
    },

    /// Negotiation traffic between two sub-connections
    WebRtcNegotiation(WebRtcMessage),
}

impl BrokerMessage {
    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if bincode serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid encoded message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtoError::Deserialization(e.to_string()))
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            BrokerMessage::Welcome { .. } => "Welcome",
            BrokerMessage::Ping => "Ping",
            BrokerMessage::Pong => "Pong",
            BrokerMessage::ServerSyn { .. } => "ServerSyn",
            BrokerMessage::ServerSynAck { .. } => "ServerSynAck",
            BrokerMessage::CreateServerRequest { .. } => "CreateServerRequest",
            BrokerMessage::CreateServerResponse { .. } => "CreateServerResponse",
            BrokerMessage::ServerListRequest { .. } => "ServerListRequest",
            BrokerMessage::ServerListResponse { .. } => "ServerListResponse",
            BrokerMessage::WebRtcNegotiation(_) => "WebRtcNegotiation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::SdpType;

    #[test]
    fn test_message_serialization_server_syn() {
        let msg = BrokerMessage::ServerSyn {
            sender: "PABC|0".to_string(),
            server_alias: "PXYZ".to_string(),
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = BrokerMessage::from_bytes(&bytes).unwrap();

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_message_serialization_create_server_request() {
        let msg = BrokerMessage::CreateServerRequest {
            alias: "PABC".to_string(),
            server_data: Some(ServerData {
                alias: "PABC".to_string(),
                name: "room1".to_string(),
                protocol: Some("chat/1".to_string()),
                meta: Some(r#"{"players":2}"#.to_string()),
            }),
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = BrokerMessage::from_bytes(&bytes).unwrap();

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_message_serialization_missing_server_data() {
        let msg = BrokerMessage::CreateServerRequest {
            alias: "PABC".to_string(),
            server_data: None,
        };

        let decoded = BrokerMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            BrokerMessage::CreateServerRequest {
                server_data: None,
                ..
            }
        ));
    }

    #[test]
    fn test_message_serialization_server_list() {
        let msg = BrokerMessage::ServerListResponse {
            servers: vec![
                ServerData {
                    alias: "PA".to_string(),
                    name: "a".to_string(),
                    ..Default::default()
                },
                ServerData {
                    alias: "PB".to_string(),
                    name: "b".to_string(),
                    ..Default::default()
                },
            ],
        };

        let decoded = BrokerMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_invalid_deserialization() {
        let invalid_bytes = vec![255, 254, 253];
        assert!(BrokerMessage::from_bytes(&invalid_bytes).is_err());
        assert!(BrokerMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_message_type() {
        assert_eq!(BrokerMessage::Ping.message_type(), "Ping");
        let msg = BrokerMessage::Welcome {
            alias: "PABC".to_string(),
        };
        assert_eq!(msg.message_type(), "Welcome");
    }

    #[test]
    fn test_candidate_message_payload() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host");
        let msg = WebRtcMessage::candidate("PA|0", "PB|0", Some(&candidate)).unwrap();

        assert_eq!(msg.kind, NegotiationKind::Candidate);
        assert_eq!(msg.parse_candidate().unwrap(), Some(candidate));
    }

    #[test]
    fn test_end_of_candidates_payload() {
        let msg = WebRtcMessage::candidate("PA|0", "PB|0", None).unwrap();
        assert_eq!(msg.json, "null");
        assert_eq!(msg.parse_candidate().unwrap(), None);
    }

    #[test]
    fn test_session_message_payload() {
        let description = SessionDescription {
            sdp: "v=0\r\na=candidate:1\r\n".to_string(),
            sdp_type: SdpType::Offer,
            original_sdp: "v=0\r\n".to_string(),
        };
        let msg = WebRtcMessage::session("PA|0", "PB|0", &description).unwrap();

        assert_eq!(msg.kind, NegotiationKind::Session);
        assert!(msg.json.contains("\"type\":\"offer\""));
        assert!(msg.json.contains("\"originalSdp\""));
        assert_eq!(msg.parse_session().unwrap(), description);
    }

    #[test]
    fn test_session_unknown_type_rejected() {
        let msg = WebRtcMessage {
            kind: NegotiationKind::Session,
            sender: "PA|0".to_string(),
            receiver: "PB|0".to_string(),
            json: r#"{"sdp":"v=0","type":"bogus","originalSdp":"v=0"}"#.to_string(),
        };
        assert!(matches!(
            msg.parse_session(),
            Err(ProtoError::InvalidPayload(_))
        ));
    }
}
