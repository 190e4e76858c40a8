//! SIP message handler.
//!
//! First stage of the SIP pipeline: parses and validates each captured SIP
//! packet, assigns the routing prefix, and forwards the parsed message to
//! the sharded transaction aggregators. Malformed or incomplete messages
//! are dropped silently; metrics are emitted for every valid message, even
//! excluded ones.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::message::{CSeq, SipMessage, latin1};
use super::{SipEvent, route_prefix, shard_of};
use crate::bus::{Bus, Event, Subscription};
use crate::config::SipMessageConfig;
use crate::metric::{self, Tags};
use crate::packet::Packet;
use crate::storage::Sink;

/// Ingress topic fed by the capture front-end.
pub const SIP_TOPIC: &str = "sip";

pub struct SipMessageHandler {
    bus: Bus,
    sink: Sink,
    subscription: Subscription,
    instances: usize,
    exclusions: HashSet<String>,
}

impl SipMessageHandler {
    pub fn new(bus: &Bus, sink: Sink, config: &SipMessageConfig, instances: usize) -> Self {
        Self {
            bus: bus.clone(),
            sink,
            subscription: bus.subscribe(SIP_TOPIC),
            instances,
            exclusions: config.exclusions.clone(),
        }
    }

    pub async fn run(mut self) {
        while let Some(message) = self.subscription.recv().await {
            if let Event::Packet(packet) = message.event {
                self.handle(packet);
            }
        }
    }

    fn handle(&self, packet: Arc<Packet>) {
        metric::counter("packets_processed", &Tags::new().with("protocol", "SIP"));

        let message = match SipMessage::parse(&packet.payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(src = %packet.src_addr, %err, "dropping unparseable SIP packet");
                metric::counter("sip_dropped", &Tags::new().with("reason", "parse"));
                return;
            }
        };

        if message.call_id().is_none() || message.from().is_none() || message.to().is_none() {
            debug!(src = %packet.src_addr, "dropping SIP message without dialog headers");
            metric::counter("sip_dropped", &Tags::new().with("reason", "validation"));
            return;
        }

        let Some(cseq) = message.cseq() else {
            debug!(src = %packet.src_addr, "dropping SIP message without CSeq");
            metric::counter("sip_dropped", &Tags::new().with("reason", "validation"));
            return;
        };
        let Some(method) = cseq.known_method() else {
            debug!(cseq_method = %cseq.method, "dropping SIP message with unknown method");
            metric::counter("sip_dropped", &Tags::new().with("reason", "method"));
            return;
        };

        let prefix = route_prefix(method);
        self.emit_metrics(prefix, &packet, &message, &cseq);

        // Exclusions suppress the raw document and the forwarding, never
        // the metrics.
        if self.exclusions.contains(method.as_str()) {
            return;
        }

        self.sink.store(
            &format!("{prefix}_raw"),
            packet.created_at,
            raw_document(&packet, &message),
        );

        let shard = self.shard(prefix, &message);
        let event = SipEvent { packet, message };
        self.bus
            .send(&format!("{prefix}_{shard}"), Event::Sip(Arc::new(event)));
    }

    /// Shard index for the routing prefix.
    ///
    /// Calls shard by Call-ID. Registrations shard by the To URI so every
    /// registration of one address-of-record lands on one shard (RFC 3261
    /// §10.2). Remaining prefixes run a single shard.
    fn shard(&self, prefix: &str, message: &SipMessage) -> usize {
        match prefix {
            "sip_call" => shard_of(message.call_id().unwrap_or_default(), self.instances),
            "sip_register" => shard_of(message.to_uri().unwrap_or_default(), self.instances),
            _ => 0,
        }
    }

    fn emit_metrics(&self, prefix: &str, packet: &Packet, message: &SipMessage, cseq: &CSeq) {
        let mut tags = Tags::new()
            .maybe("src_host", packet.src_addr.host.clone())
            .maybe("dst_host", packet.dst_addr.host.clone())
            .with("cseq_method", cseq.method.clone());

        if let Some(method) = message.request_method() {
            tags = tags.with("method", method.to_string());
        }
        if let Some(code) = message.status_code() {
            tags = tags
                .with("status_type", format!("{}xx", code / 100))
                .with("status_code", code.to_string());
        }

        metric::counter(format!("{prefix}_messages"), &tags);
    }
}

/// Per-message raw document, addressed by the packet's own timestamp.
fn raw_document(packet: &Packet, message: &SipMessage) -> serde_json::Value {
    json!({
        "created_at": packet.timestamp_millis(),
        "src_addr": packet.src_addr.addr.to_string(),
        "src_port": packet.src_addr.port,
        "src_host": &packet.src_addr.host,
        "dst_addr": packet.dst_addr.addr.to_string(),
        "dst_port": packet.dst_addr.port,
        "dst_host": &packet.dst_addr.host,
        "call_id": message.call_id(),
        "raw_data": latin1(&packet.payload),
        "attributes": &packet.attributes,
    })
}
