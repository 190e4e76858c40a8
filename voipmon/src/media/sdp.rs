//! SDP session descriptions.
//!
//! Signaling handlers publish the media endpoints negotiated in SDP on the
//! `sdp_info` topic; the session aggregator caches them to attribute RTP
//! reports to calls, and the management registry pushes them to RTP-enabled
//! capture agents.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::packet::Address;

/// Codec identity plus its E-model constants: the equipment impairment
/// factor `ie` and the packet-loss robustness `bpl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub name: String,
    pub ie: f32,
    pub bpl: f32,
}

/// A media endpoint announced in SDP, keyed by [`session_id`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpSession {
    pub id: u64,
    pub call_id: String,
    /// Negotiation timestamp, milliseconds since the epoch.
    pub timestamp: i64,
    pub codec: CodecInfo,
}

/// Cache key of a media endpoint: the IPv4 address in the high half, the
/// even-masked port in the low half. Masking the lowest port bit folds an
/// RTP port and its implicit RTCP port (`port + 1`) onto one session.
///
/// IPv6 media endpoints are not attributable this way and yield no key.
pub fn session_id(address: &Address) -> Option<u64> {
    match address.addr {
        IpAddr::V4(v4) => {
            let ip = u32::from_be_bytes(v4.octets()) as u64;
            Some(ip << 32 | u64::from(address.port & 0xFFFE))
        }
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_and_rtcp_ports_share_a_session() {
        let rtp = Address::new("10.1.2.3".parse().unwrap(), 10_000);
        let rtcp = Address::new("10.1.2.3".parse().unwrap(), 10_001);

        assert_eq!(session_id(&rtp), session_id(&rtcp));
        assert_ne!(
            session_id(&rtp),
            session_id(&Address::new("10.1.2.3".parse().unwrap(), 10_002))
        );
    }

    #[test]
    fn test_id_layout() {
        let address = Address::new("0.0.0.1".parse().unwrap(), 2);
        assert_eq!(session_id(&address), Some(1 << 32 | 2));
    }

    #[test]
    fn test_ipv6_is_not_keyed() {
        let address = Address::new("::1".parse().unwrap(), 10_000);
        assert_eq!(session_id(&address), None);
    }

    #[test]
    fn test_serde_shape() {
        let session = SdpSession {
            id: 42,
            call_id: "abc@host".into(),
            timestamp: 1_700_000_000_000,
            codec: CodecInfo {
                payload_type: 8,
                name: "PCMA".into(),
                ie: 0.0,
                bpl: 34.0,
            },
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["codec"]["name"], "PCMA");
        let back: SdpSession = serde_json::from_value(value).unwrap();
        assert_eq!(back.call_id, "abc@host");
    }
}
