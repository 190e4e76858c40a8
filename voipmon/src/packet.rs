//! Packet and address records flowing between pipeline stages.
//!
//! A [`Packet`] is produced by the capture front-end and is never mutated
//! once it enters the core, except for its `attributes`, which are additive.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A network endpoint observed by a capture agent.
///
/// The symbolic `host` name is assigned by the capture front-end and is
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub addr: IpAddr,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Address {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            host: None,
        }
    }

    pub fn with_host(addr: IpAddr, port: u16, host: impl Into<String>) -> Self {
        Self {
            addr,
            port,
            host: Some(host.into()),
        }
    }

    /// Comparison key ordering addresses by `(ip, port)`.
    ///
    /// Used to build keys that are symmetric in the two endpoints of a
    /// media stream.
    pub fn sort_key(&self) -> (IpAddr, u16) {
        (self.addr, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

const RTCP: &str = "RTCP";
const RTP: &str = "RTP";
const SIP: &str = "SIP";
const ICMP: &str = "ICMP";
const RTPR: &str = "RTPR";
const SMPP: &str = "SMPP";

/// Protocol code assigned by the capture front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Rtcp = 1,
    Rtp = 2,
    Sip = 3,
    Icmp = 4,
    Rtpr = 5,
    Smpp = 6,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtcp => RTCP,
            Protocol::Rtp => RTP,
            Protocol::Sip => SIP,
            Protocol::Icmp => ICMP,
            Protocol::Rtpr => RTPR,
            Protocol::Smpp => SMPP,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        match code {
            1 => Ok(Protocol::Rtcp),
            2 => Ok(Protocol::Rtp),
            3 => Ok(Protocol::Sip),
            4 => Ok(Protocol::Icmp),
            5 => Ok(Protocol::Rtpr),
            6 => Ok(Protocol::Smpp),
            other => Err(other),
        }
    }
}

/// An attribute value attached to a packet or an aggregated record.
///
/// Attributes flow into raw documents and may be extended by user-defined
/// functions; only string and boolean values survive a UDF round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Bool(bool),
    Number(f64),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Number(value)
    }
}

/// Attribute map shared by packets and aggregated records.
pub type Attributes = HashMap<String, AttrValue>;

/// A decoded packet record handed over by the capture front-end.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Wall-clock capture timestamp with nanosecond resolution.
    pub created_at: DateTime<Utc>,
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    pub payload: Bytes,
    pub attributes: Attributes,
}

impl Packet {
    pub fn new(
        created_at: DateTime<Utc>,
        src_addr: Address,
        dst_addr: Address,
        protocol: Protocol,
        payload: Bytes,
    ) -> Self {
        Self {
            created_at,
            src_addr,
            dst_addr,
            protocol,
            payload,
            attributes: Attributes::new(),
        }
    }

    /// Capture timestamp as milliseconds since the epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_codes() {
        assert_matches!(Protocol::try_from(3), Ok(Protocol::Sip));
        assert_matches!(Protocol::try_from(5), Ok(Protocol::Rtpr));
        assert_matches!(Protocol::try_from(0), Err(0));
        assert_eq!(Protocol::Rtcp as u8, 1);
        assert_eq!(Protocol::Smpp as u8, 6);
    }

    #[test]
    fn test_address_display() {
        let addr = Address::new("10.0.0.1".parse().unwrap(), 5060);
        assert_eq!(addr.to_string(), "10.0.0.1:5060");
    }

    #[test]
    fn test_attr_value_serializes_untagged() {
        let v = serde_json::to_value(AttrValue::from("abc")).unwrap();
        assert_eq!(v, serde_json::json!("abc"));
        let v = serde_json::to_value(AttrValue::from(true)).unwrap();
        assert_eq!(v, serde_json::json!(true));
    }
}
