//! End-to-end pipeline scenarios.
//!
//! Wires the real workers over one bus, replaces the document store with an
//! in-memory recorder, and drives packets through the ingress topics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::net::UdpSocket;

use voipmon::Result;
use voipmon::bus::{Bus, Event};
use voipmon::config::{
    ManagementConfig, RtprConfig, SipMessageConfig, SipTransactionConfig, StorageConfig, UdfConfig,
};
use voipmon::management::ManagementSocket;
use voipmon::media::report::{ReportSource, wire};
use voipmon::media::sdp::{CodecInfo, SdpSession, session_id};
use voipmon::media::session::RtprSessionWorker;
use voipmon::packet::{Address, Packet, Protocol};
use voipmon::sip::ROUTE_PREFIXES;
use voipmon::sip::handler::SipMessageHandler;
use voipmon::sip::transaction::SipTransactionWorker;
use voipmon::storage::{DocumentStore, Sink, StorageWriter};
use voipmon::udf::UdfDispatcher;

#[derive(Default)]
struct MemoryStore {
    writes: Mutex<Vec<(String, Value)>>,
}

impl MemoryStore {
    fn find(&self, collection_prefix: &str) -> Vec<(String, Value)> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(collection, _)| collection.starts_with(collection_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
        let mut writes = self.writes.lock().unwrap();
        for document in documents {
            writes.push((collection.to_string(), document));
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, _key_field: &str, document: Value) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((collection.to_string(), document));
        Ok(())
    }
}

struct Pipeline {
    bus: Bus,
    store: Arc<MemoryStore>,
}

fn pipeline() -> Pipeline {
    let bus = Bus::new();
    let store = Arc::new(MemoryStore::default());

    let sink = Sink::new(bus.clone(), "%Y%m%d");
    let storage_config = StorageConfig {
        batch_size: 256,
        flush_interval: 100,
    };
    tokio::spawn(StorageWriter::new(&bus, store.clone(), &storage_config).run());

    let udf = UdfDispatcher::new(bus.clone(), &UdfConfig::default());
    udf.start();

    tokio::spawn(SipMessageHandler::new(&bus, sink.clone(), &SipMessageConfig::default(), 1).run());

    let transaction_config = SipTransactionConfig {
        expiration_delay: 100,
        termination_timeout: 10_000,
    };
    for prefix in ROUTE_PREFIXES {
        tokio::spawn(
            SipTransactionWorker::new(&bus, sink.clone(), udf.clone(), prefix, 0, &transaction_config)
                .run(),
        );
    }

    tokio::spawn(RtprSessionWorker::new(&bus, sink.clone(), &RtprConfig::default()).run());

    Pipeline { bus, store }
}

fn sip_packet(raw: String, at: DateTime<Utc>) -> Arc<Packet> {
    Arc::new(Packet::new(
        at,
        Address::with_host("192.0.2.1".parse().unwrap(), 5060, "pbx-a"),
        Address::with_host("192.0.2.2".parse().unwrap(), 5060, "pbx-b"),
        Protocol::Sip,
        Bytes::from(raw.into_bytes()),
    ))
}

fn request(method: &str, call_id: &str, at: DateTime<Utc>) -> Arc<Packet> {
    sip_packet(
        format!(
            "{method} sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP a.example.com;branch=z9hG4bK{call_id}\r\n\
            To: <sip:bob@example.com>\r\n\
            From: <sip:alice@example.com>;tag=100\r\n\
            Call-ID: {call_id}\r\n\
            CSeq: 1 {method}\r\n\r\n"
        ),
        at,
    )
}

fn response(code: u16, method: &str, call_id: &str, at: DateTime<Utc>) -> Arc<Packet> {
    sip_packet(
        format!(
            "SIP/2.0 {code} Reason\r\n\
            Via: SIP/2.0/UDP a.example.com;branch=z9hG4bK{call_id}\r\n\
            To: <sip:bob@example.com>;tag=200\r\n\
            From: <sip:alice@example.com>;tag=100\r\n\
            Call-ID: {call_id}\r\n\
            CSeq: 1 {method}\r\n\r\n"
        ),
        at,
    )
}

async fn settle() {
    // Lets the workers drain and the storage writer flush.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
}

#[tokio::test(start_paused = true)]
async fn test_options_transaction_lands_in_its_index() {
    let p = pipeline();
    let t0 = Utc::now();

    p.bus
        .publish("sip", Event::Packet(request("OPTIONS", "opt-1", t0)));
    p.bus.publish(
        "sip",
        Event::Packet(response(
            200,
            "OPTIONS",
            "opt-1",
            t0 + ChronoDuration::milliseconds(25),
        )),
    );
    settle().await;

    let expected = format!("sip_options_index0_{}", t0.format("%Y%m%d"));
    let writes = p.store.find(&expected);
    assert_eq!(writes.len(), 1, "one index document expected");
    let (_, document) = &writes[0];
    assert_eq!(document["state"], "succeed");
    assert_eq!(document["call_id"], "opt-1");
    let created = document["created_at"].as_i64().unwrap();
    let terminated = document["terminated_at"].as_i64().unwrap();
    assert_eq!(terminated - created, 25);
}

#[tokio::test(start_paused = true)]
async fn test_message_transaction_succeeds() {
    let p = pipeline();
    let t0 = Utc::now();

    p.bus
        .publish("sip", Event::Packet(request("MESSAGE", "msg-1", t0)));
    p.bus.publish(
        "sip",
        Event::Packet(response(
            200,
            "MESSAGE",
            "msg-1",
            t0 + ChronoDuration::milliseconds(25),
        )),
    );
    settle().await;

    let writes = p.store.find("sip_message_index0_");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1["state"], "succeed");
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_invite_expires_failed() {
    let p = pipeline();
    // Already older than the termination timeout when it arrives.
    let t0 = Utc::now() - ChronoDuration::seconds(60);

    p.bus
        .publish("sip", Event::Packet(request("INVITE", "inv-1", t0)));
    settle().await;

    let writes = p.store.find("sip_call_index0_");
    assert_eq!(writes.len(), 1);
    let (_, document) = &writes[0];
    assert_eq!(document["state"], "failed");
    let created = document["created_at"].as_i64().unwrap();
    let terminated = document["terminated_at"].as_i64().unwrap();
    assert_eq!(terminated - created, 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_rtp_report_enriched_from_sdp() {
    let p = pipeline();

    let rtp_addr = Address::new("10.0.0.1".parse().unwrap(), 10_000);
    let sdp = SdpSession {
        id: session_id(&rtp_addr).unwrap(),
        call_id: "sdp-call-7".to_string(),
        timestamp: Utc::now().timestamp_millis(),
        codec: CodecInfo {
            payload_type: 8,
            name: "PCMA".to_string(),
            ie: 0.0,
            bpl: 34.0,
        },
    };
    p.bus.publish("sdp_info", Event::SdpInfo(Arc::new(vec![sdp])));
    // The SDP cache must be populated before the report arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = wire::sample(ReportSource::Rtp);
    assert!(report.call_id.is_none());
    let packet = Packet::new(
        Utc::now(),
        rtp_addr,
        Address::new("10.0.0.2".parse().unwrap(), 20_000),
        Protocol::Rtpr,
        wire::encode(&report),
    );
    p.bus.publish("rtpr", Event::Packet(Arc::new(packet)));
    settle().await;

    let writes = p.store.find("rtpr_rtp_raw_");
    assert_eq!(writes.len(), 1);
    let (_, document) = &writes[0];
    assert_eq!(document["call_id"], "sdp-call-7");
    assert_eq!(document["codec_name"], "PCMA");
    let mos = document["mos"].as_f64().unwrap();
    assert!((1.0..=4.5).contains(&mos), "{mos}");
}

#[tokio::test]
async fn test_agent_registration_and_sdp_push() {
    let bus = Bus::new();
    let sink = Sink::new(bus.clone(), "%Y%m%d");
    let config = ManagementConfig {
        uri: "udp://127.0.0.1:0".to_string(),
        expiration_delay: 60_000,
        expiration_timeout: 120_000,
    };
    let management = ManagementSocket::bind(&bus, sink, &config).await.unwrap();
    let addr = management.local_addr().unwrap();
    tokio::spawn(management.run());

    let register = |name: &str| {
        serde_json::to_vec(&serde_json::json!({
            "type": "register",
            "payload": {
                "timestamp": Utc::now().timestamp_millis(),
                "name": name,
                "config": {"rtp": {"enabled": true}},
            },
        }))
        .unwrap()
    };

    // Two agents on distinct source ports.
    let agent_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let agent_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    agent_a.send_to(&register("agent-a"), addr).await.unwrap();
    agent_b.send_to(&register("agent-b"), addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let session = SdpSession {
        id: 1,
        call_id: "push-call-1".to_string(),
        timestamp: Utc::now().timestamp_millis(),
        codec: CodecInfo {
            payload_type: 0,
            name: "PCMU".to_string(),
            ie: 0.0,
            bpl: 25.1,
        },
    };
    bus.publish("sdp_info", Event::SdpInfo(Arc::new(vec![session])));

    let mut buf = [0u8; 2048];
    for agent in [&agent_a, &agent_b] {
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), agent.recv_from(&mut buf))
            .await
            .expect("agent should receive the SDP push")
            .unwrap();
        let value: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["type"], "sdp_session");
        assert_eq!(value["payload"]["call_id"], "push-call-1");
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_udf_does_not_drop_transactions() {
    let p = pipeline();
    let mut downstream = p.bus.subscribe("sip_call_transaction");
    let t0 = Utc::now();

    // No consumer exists on sip_call_transaction_udf.
    p.bus
        .publish("sip", Event::Packet(request("INVITE", "udf-1", t0)));
    p.bus.publish(
        "sip",
        Event::Packet(response(
            200,
            "INVITE",
            "udf-1",
            t0 + ChronoDuration::milliseconds(30),
        )),
    );
    settle().await;

    let message = downstream.try_recv().expect("transaction emitted unmodified");
    let Event::Transaction(transaction) = message.event else {
        panic!("expected a transaction event");
    };
    assert_eq!(transaction.call_id, "udf-1");
    assert!(transaction.attributes.is_empty());
}
