//! RTP report session aggregation.
//!
//! Pairs the RTP/RTCP reports of one media stream into a session keyed
//! symmetrically over the two endpoints, so reports observed in either
//! direction collapse onto the same session. Reports lacking a Call-ID are
//! attributed through the SDP cache, which also supplies the codec
//! constants for the E-model quality scores.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, error};

use super::report::{ReportSource, RtpReportPayload};
use super::sdp::{SdpSession, session_id};
use super::{R0, compute_mos};
use crate::bus::{Bus, Event, Subscription};
use crate::config::RtprConfig;
use crate::error::Error;
use crate::metric::{self, Tags};
use crate::packet::Packet;
use crate::storage::Sink;

/// Ingress topic for RTP-derived reports.
pub const RTPR_TOPIC: &str = "rtpr";

/// Ingress topic for RTCP-derived reports.
pub const RTPR_RTCP_TOPIC: &str = "rtpr_rtcp";

/// Ingress topic for SDP session descriptions.
pub const SDP_TOPIC: &str = "sdp_info";

/// Terminated sessions leave on this topic for call correlation.
pub const MEDIA_TOPIC: &str = "media";

/// Direction-agnostic session key: endpoint pair ordered by `(ip, port)`,
/// combined with the SSRC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    lo: (IpAddr, u16),
    hi: (IpAddr, u16),
    ssrc: u32,
}

impl SessionKey {
    pub fn new(packet: &Packet, ssrc: u32) -> Self {
        let src = packet.src_addr.sort_key();
        let dst = packet.dst_addr.sort_key();
        let (lo, hi) = if src <= dst { (src, dst) } else { (dst, src) };
        Self { lo, hi, ssrc }
    }
}

/// A media stream under aggregation.
#[derive(Debug)]
pub struct RtprSession {
    pub src_addr: crate::packet::Address,
    pub dst_addr: crate::packet::Address,
    pub created_at: DateTime<Utc>,
    pub last_report_at: DateTime<Utc>,
    pub report_count: u32,
    /// Running aggregate over every merged report.
    pub report: RtpReportPayload,
}

impl RtprSession {
    fn new(packet: &Packet, report: RtpReportPayload) -> Self {
        Self {
            src_addr: packet.src_addr.clone(),
            dst_addr: packet.dst_addr.clone(),
            created_at: packet.created_at,
            last_report_at: packet.created_at,
            report_count: 1,
            report,
        }
    }

    fn update(&mut self, packet: &Packet, report: &RtpReportPayload) {
        self.report.merge(report);
        self.report_count += 1;
        self.last_report_at = self.last_report_at.max(packet.created_at);
        self.report.duration_millis = (self.last_report_at - self.created_at)
            .num_milliseconds()
            .max(0) as u32;
    }
}

/// Copies call attribution and codec identity from a cached SDP session
/// and derives the E-model scores.
fn enrich(report: &mut RtpReportPayload, session: &SdpSession) {
    report.call_id = Some(session.call_id.clone());
    report.payload_type = session.codec.payload_type;
    report.codec_name = Some(session.codec.name.clone());

    let ppl = report.fraction_lost * 100.0;
    let ie = session.codec.ie;
    let bpl = session.codec.bpl;
    let ie_eff = if ppl + bpl > 0.0 {
        ie + (95.0 - ie) * ppl / (ppl + bpl)
    } else {
        ie
    };
    let r_factor = (R0 - ie_eff).clamp(0.0, R0);
    report.r_factor = Some(r_factor);
    report.mos = Some(compute_mos(r_factor));
}

/// Worker owning the SDP cache and both session maps.
pub struct RtprSessionWorker {
    bus: Bus,
    sink: Sink,
    rtp_subscription: Subscription,
    rtcp_subscription: Subscription,
    sdp_subscription: Subscription,
    sdp: HashMap<u64, SdpSession>,
    rtp: HashMap<SessionKey, RtprSession>,
    rtcp: HashMap<SessionKey, RtprSession>,
    config: RtprConfig,
}

impl RtprSessionWorker {
    pub fn new(bus: &Bus, sink: Sink, config: &RtprConfig) -> Self {
        Self {
            bus: bus.clone(),
            sink,
            rtp_subscription: bus.subscribe(RTPR_TOPIC),
            rtcp_subscription: bus.subscribe(RTPR_RTCP_TOPIC),
            sdp_subscription: bus.subscribe(SDP_TOPIC),
            sdp: HashMap::new(),
            rtp: HashMap::new(),
            rtcp: HashMap::new(),
            config: config.clone(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.expiration_delay());
        loop {
            tokio::select! {
                message = self.rtp_subscription.recv() => match message {
                    Some(message) => self.on_message(message.event),
                    None => break,
                },
                message = self.rtcp_subscription.recv() => match message {
                    Some(message) => self.on_message(message.event),
                    None => break,
                },
                message = self.sdp_subscription.recv() => match message {
                    Some(message) => self.on_message(message.event),
                    None => break,
                },
                _ = tick.tick() => self.expire(),
            }
        }
    }

    fn on_message(&mut self, event: Event) {
        match event {
            Event::Packet(packet) => self.on_report(&packet),
            Event::SdpInfo(sessions) => self.on_sdp(&sessions),
            _ => {}
        }
    }

    fn on_sdp(&mut self, sessions: &[SdpSession]) {
        for session in sessions {
            self.sdp.insert(session.id, session.clone());
        }
    }

    fn on_report(&mut self, packet: &Packet) {
        metric::counter(
            "packets_processed",
            &Tags::new().with("protocol", packet.protocol.as_str()),
        );

        let mut report = match RtpReportPayload::decode(&packet.payload[..]) {
            Ok(report) => report,
            // A broken agent, not wire noise. The worker continues with
            // the next packet.
            Err(Error::UnknownReportSource(byte)) => {
                error!(
                    src = %packet.src_addr,
                    dst = %packet.dst_addr,
                    payload_len = packet.payload.len(),
                    source_byte = byte,
                    "RTP report with unknown source"
                );
                metric::counter("rtpr_dropped", &Tags::new().with("reason", "source"));
                return;
            }
            Err(err) => {
                debug!(src = %packet.src_addr, %err, "dropping undecodable RTP report");
                metric::counter("rtpr_dropped", &Tags::new().with("reason", "parse"));
                return;
            }
        };

        if report.cumulative {
            // Legacy agents pre-aggregate; nothing left to correlate.
            debug!(src = %packet.src_addr, "dropping cumulative RTP report");
            metric::counter("rtpr_dropped", &Tags::new().with("reason", "cumulative"));
            return;
        }

        if report.call_id.is_none() {
            let sdp = session_id(&packet.src_addr)
                .and_then(|id| self.sdp.get(&id))
                .or_else(|| session_id(&packet.dst_addr).and_then(|id| self.sdp.get(&id)));
            if let Some(sdp) = sdp {
                enrich(&mut report, sdp);
            }
        }

        self.sink.store(
            &format!("rtpr_{}_raw", report.source.as_str()),
            packet.created_at,
            raw_document(packet, &report),
        );

        if !self.config.cumulative_metrics {
            emit_metrics(packet, &report);
        }

        let key = SessionKey::new(packet, report.ssrc);
        let source = report.source;
        let sessions = match source {
            ReportSource::Rtp => &mut self.rtp,
            ReportSource::Rtcp => &mut self.rtcp,
        };
        match sessions.get_mut(&key) {
            Some(session) => session.update(packet, &report),
            None => {
                sessions.insert(key, RtprSession::new(packet, report));
            }
        }
    }

    /// Evicts stale SDP entries and terminates idle sessions.
    fn expire(&mut self) {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.aggregation_timeout())
            .unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 2));

        let deadline = now.timestamp_millis() - timeout.num_milliseconds();
        self.sdp.retain(|_, session| session.timestamp >= deadline);

        let cumulative_metrics = self.config.cumulative_metrics;
        let bus = self.bus.clone();
        for sessions in [&mut self.rtp, &mut self.rtcp] {
            let expired: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, session)| session.last_report_at + timeout < now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                let session = sessions.remove(&key).expect("expired key");
                debug!(
                    src = %session.src_addr,
                    dst = %session.dst_addr,
                    reports = session.report_count,
                    "RTP report session terminated"
                );
                if cumulative_metrics {
                    emit_session_metrics(&session);
                }
                bus.send(MEDIA_TOPIC, Event::Media(Arc::new(session)));
            }
        }
    }
}

fn quality_tags(
    src_host: &Option<String>,
    dst_host: &Option<String>,
    report: &RtpReportPayload,
) -> Tags {
    Tags::new()
        .maybe("src_host", src_host.clone())
        .maybe("dst_host", dst_host.clone())
        .maybe("codec", report.codec_name.clone())
}

fn emit_report(prefix: &str, tags: &Tags, report: &RtpReportPayload) {
    metric::summary(format!("{prefix}_jitter"), tags, report.avg_jitter as f64);
    metric::summary(
        format!("{prefix}_expected-packets"),
        tags,
        report.expected_packet_count as f64,
    );
    metric::summary(
        format!("{prefix}_lost-packets"),
        tags,
        report.lost_packet_count as f64,
    );
    metric::summary(
        format!("{prefix}_rejected-packets"),
        tags,
        report.rejected_packet_count as f64,
    );
    metric::timer(format!("{prefix}_duration"), tags, report.duration_millis as f64);
    if let Some(r_factor) = report.r_factor {
        metric::summary(format!("{prefix}_r-factor"), tags, r_factor as f64);
    }
    if let Some(mos) = report.mos {
        metric::summary(format!("{prefix}_mos"), tags, mos as f64);
    }
}

fn emit_metrics(packet: &Packet, report: &RtpReportPayload) {
    let prefix = format!("rtpr_{}", report.source.as_str());
    let tags = quality_tags(&packet.src_addr.host, &packet.dst_addr.host, report);
    emit_report(&prefix, &tags, report);
}

fn emit_session_metrics(session: &RtprSession) {
    let prefix = format!("rtpr_{}", session.report.source.as_str());
    let tags = quality_tags(&session.src_addr.host, &session.dst_addr.host, &session.report);
    emit_report(&prefix, &tags, &session.report);
}

/// Per-report snapshot for the raw collections.
fn raw_document(packet: &Packet, report: &RtpReportPayload) -> serde_json::Value {
    let mut document = report.document();
    let extra = json!({
        "reported_at": packet.timestamp_millis(),
        "src_addr": packet.src_addr.addr.to_string(),
        "src_port": packet.src_addr.port,
        "src_host": &packet.src_addr.host,
        "dst_addr": packet.dst_addr.addr.to_string(),
        "dst_port": packet.dst_addr.port,
        "dst_host": &packet.dst_addr.host,
    });
    if let (Some(document), Some(extra)) = (document.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            document.insert(key.clone(), value.clone());
        }
    }
    document
}
