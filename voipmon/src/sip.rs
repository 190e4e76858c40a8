//! SIP correlation pipeline.
//!
//! Stage order: the message handler parses, validates and shards
//! ([`handler`]), the transaction aggregator joins request/response pairs
//! ([`transaction`]), and the call aggregator joins transactions into
//! dialogs ([`call`]).

use std::sync::Arc;

use crate::packet::Packet;

pub mod call;
pub mod handler;
pub mod message;
pub mod transaction;

pub use message::{Method, SipMessage};

/// A packet paired with its parsed SIP message, forwarded between the
/// pipeline stages by shared reference.
#[derive(Debug)]
pub struct SipEvent {
    pub packet: Arc<Packet>,
    pub message: SipMessage,
}

/// Routing prefix of a CSeq method.
///
/// Out-of-dialog method families get their own topic and collection
/// namespace; everything else belongs to the call pipeline.
pub fn route_prefix(method: Method) -> &'static str {
    match method {
        Method::Register => "sip_register",
        Method::Notify => "sip_notify",
        Method::Message => "sip_message",
        Method::Options => "sip_options",
        Method::Subscribe => "sip_subscribe",
        _ => "sip_call",
    }
}

/// Prefixes served by the transaction aggregators.
pub const ROUTE_PREFIXES: [&str; 6] = [
    "sip_call",
    "sip_register",
    "sip_notify",
    "sip_message",
    "sip_options",
    "sip_subscribe",
];

/// Deterministic shard index, stable for the process lifetime.
pub(crate) fn shard_of(key: &str, instances: usize) -> usize {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % instances as u64) as usize
}
