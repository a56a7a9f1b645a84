//! Negotiation payloads.
//!
//! These travel as JSON inside [`WebRtcMessage`](crate::WebRtcMessage) and
//! follow the field names browsers use for session descriptions and ICE
//! candidates, so either end can be a browser or a native peer.

use serde::{Deserialize, Serialize};

/// Session description type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initial offer
    Offer,
    /// Final answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback to the last stable state
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
            Self::Pranswer => write!(f, "pranswer"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// Offer or answer as sent between peers
///
/// `sdp` may carry the fully gathered candidate set, while `original_sdp` is
/// the description exactly as first generated. Receivers that fail to parse
/// the augmented variant fall back to the original one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// Description to apply
    pub sdp: String,
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Description as first generated, before candidates were folded in
    #[serde(rename = "originalSdp", default)]
    pub original_sdp: String,
}

impl SessionDescription {
    /// Create a description whose original variant equals `sdp`
    #[must_use]
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        let sdp = sdp.into();
        Self {
            original_sdp: sdp.clone(),
            sdp,
            sdp_type,
        }
    }

    /// Variant of this description built from the original SDP
    #[must_use]
    pub fn original(&self) -> Self {
        Self {
            sdp: self.original_sdp.clone(),
            sdp_type: self.sdp_type,
            original_sdp: self.original_sdp.clone(),
        }
    }
}

/// Connectivity candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:...`)
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate for the first media section
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn fields(&self) -> Vec<&str> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        line.split_whitespace().collect()
    }

    /// Candidate type (`host`, `srflx`, `prflx`, `relay`)
    #[must_use]
    pub fn candidate_type(&self) -> Option<&str> {
        let fields = self.fields();
        let idx = fields.iter().position(|f| *f == "typ")?;
        fields.get(idx + 1).copied()
    }

    /// Whether this is a server reflexive candidate
    #[must_use]
    pub fn is_server_reflexive(&self) -> bool {
        self.candidate_type() == Some("srflx")
    }

    /// Transport port of the candidate
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        // candidate:<foundation> <component> <transport> <priority> <address> <port> typ ...
        self.fields().get(5)?.parse().ok()
    }

    /// Related (base) port, present on reflexive and relay candidates
    #[must_use]
    pub fn related_port(&self) -> Option<u16> {
        let fields = self.fields();
        let idx = fields.iter().position(|f| *f == "rport")?;
        fields.get(idx + 1)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRFLX: &str =
        "candidate:842163049 1 udp 1677729535 203.0.113.7 61020 typ srflx raddr 192.168.1.4 rport 5000 generation 0";

    #[test]
    fn test_candidate_fields() {
        let candidate = IceCandidate::new(SRFLX);
        assert_eq!(candidate.candidate_type(), Some("srflx"));
        assert!(candidate.is_server_reflexive());
        assert_eq!(candidate.port(), Some(61020));
        assert_eq!(candidate.related_port(), Some(5000));
    }

    #[test]
    fn test_host_candidate_has_no_related_port() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host");
        assert_eq!(candidate.candidate_type(), Some("host"));
        assert!(!candidate.is_server_reflexive());
        assert_eq!(candidate.port(), Some(5000));
        assert_eq!(candidate.related_port(), None);
    }

    #[test]
    fn test_candidate_with_attribute_prefix() {
        let candidate = IceCandidate::new(format!("a={SRFLX}"));
        assert_eq!(candidate.port(), Some(61020));
        assert!(candidate.is_server_reflexive());
    }

    #[test]
    fn test_malformed_candidate() {
        let candidate = IceCandidate::new("garbage");
        assert_eq!(candidate.candidate_type(), None);
        assert_eq!(candidate.port(), None);
        assert_eq!(candidate.related_port(), None);
    }

    #[test]
    fn test_candidate_json_field_names() {
        let json = serde_json::to_string(&IceCandidate::new("candidate:1")).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));

        let parsed: IceCandidate = serde_json::from_str(r#"{"candidate":"candidate:2"}"#).unwrap();
        assert_eq!(parsed.sdp_mid, None);
    }

    #[test]
    fn test_session_description_original() {
        let mut description = SessionDescription::new(SdpType::Answer, "v=0\r\n");
        description.sdp.push_str("a=candidate:1\r\n");

        let original = description.original();
        assert_eq!(original.sdp, "v=0\r\n");
        assert_eq!(original.sdp_type, SdpType::Answer);
    }
}
