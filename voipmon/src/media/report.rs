//! RTP report decoding and aggregation.
//!
//! Capture agents ship one binary report per observation window. Wire
//! layout, all integers big-endian:
//!
//! ```text
//! u8  source (0 = RTP, 1 = RTCP)    u8  payload type
//! u8  flags (bit 0: cumulative)    u8  reserved
//! u32 ssrc
//! u32 expected   u32 received   u32 lost   u32 rejected
//! u32 duration (ms)
//! f32 fraction lost
//! f32 last jitter   f32 avg jitter   f32 min jitter   f32 max jitter
//! i64 created at (ms)   i64 started at (ms)
//! u16 call id length, followed by that many bytes (UTF-8)
//! ```

use bytes::Buf;
use serde_json::json;

use crate::error::{Error, Result};

/// Fixed part of the wire layout, everything before the call id.
const FIXED_LEN: usize = 66;

const FLAG_CUMULATIVE: u8 = 0x01;

/// Where a report was measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportSource {
    Rtp,
    Rtcp,
}

impl ReportSource {
    /// Lowercase token used in metric and collection names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportSource::Rtp => "rtp",
            ReportSource::Rtcp => "rtcp",
        }
    }
}

/// A decoded RTP report, optionally enriched with SDP-derived fields.
#[derive(Debug, Clone)]
pub struct RtpReportPayload {
    pub source: ReportSource,
    pub payload_type: u8,
    pub ssrc: u32,
    pub expected_packet_count: u32,
    pub received_packet_count: u32,
    pub lost_packet_count: u32,
    pub rejected_packet_count: u32,
    pub duration_millis: u32,
    pub fraction_lost: f32,
    pub last_jitter: f32,
    pub avg_jitter: f32,
    pub min_jitter: f32,
    pub max_jitter: f32,
    pub created_at_millis: i64,
    pub started_at_millis: i64,
    /// Legacy agents pre-aggregate; such reports are discarded.
    pub cumulative: bool,
    pub call_id: Option<String>,
    // Enrichment, never on the wire.
    pub codec_name: Option<String>,
    pub r_factor: Option<f32>,
    pub mos: Option<f32>,
}

impl RtpReportPayload {
    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < FIXED_LEN {
            return Err(Error::ReportParse(format!(
                "{} bytes, need at least {FIXED_LEN}",
                buf.remaining()
            )));
        }

        // An out-of-range source byte is an agent bug, not wire noise.
        let source = match buf.get_u8() {
            0 => ReportSource::Rtp,
            1 => ReportSource::Rtcp,
            other => return Err(Error::UnknownReportSource(other)),
        };
        let payload_type = buf.get_u8();
        let flags = buf.get_u8();
        let _reserved = buf.get_u8();

        let ssrc = buf.get_u32();
        let expected_packet_count = buf.get_u32();
        let received_packet_count = buf.get_u32();
        let lost_packet_count = buf.get_u32();
        let rejected_packet_count = buf.get_u32();
        let duration_millis = buf.get_u32();

        let fraction_lost = buf.get_f32();
        let last_jitter = buf.get_f32();
        let avg_jitter = buf.get_f32();
        let min_jitter = buf.get_f32();
        let max_jitter = buf.get_f32();

        let created_at_millis = buf.get_i64();
        let started_at_millis = buf.get_i64();

        let call_id_len = buf.get_u16() as usize;
        let call_id = if call_id_len == 0 {
            None
        } else {
            if buf.remaining() < call_id_len {
                return Err(Error::ReportParse("truncated call id".to_string()));
            }
            let raw = buf.copy_to_bytes(call_id_len);
            Some(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::ReportParse("call id is not UTF-8".to_string()))?,
            )
        };

        Ok(Self {
            source,
            payload_type,
            ssrc,
            expected_packet_count,
            received_packet_count,
            lost_packet_count,
            rejected_packet_count,
            duration_millis,
            fraction_lost,
            last_jitter,
            avg_jitter,
            min_jitter,
            max_jitter,
            created_at_millis,
            started_at_millis,
            cumulative: flags & FLAG_CUMULATIVE != 0,
            call_id,
            codec_name: None,
            r_factor: None,
            mos: None,
        })
    }

    /// Folds `other` into this running aggregate.
    ///
    /// Counters add; jitter extrema combine; the average jitter is the mean
    /// weighted by each side's received packet count; `last` takes the
    /// newer report's value.
    pub fn merge(&mut self, other: &RtpReportPayload) {
        let weight_self = self.received_packet_count as f64;
        let weight_other = other.received_packet_count as f64;
        if weight_self + weight_other > 0.0 {
            self.avg_jitter = ((self.avg_jitter as f64 * weight_self
                + other.avg_jitter as f64 * weight_other)
                / (weight_self + weight_other)) as f32;
        }

        self.expected_packet_count += other.expected_packet_count;
        self.received_packet_count += other.received_packet_count;
        self.lost_packet_count += other.lost_packet_count;
        self.rejected_packet_count += other.rejected_packet_count;

        self.fraction_lost = if self.expected_packet_count > 0 {
            self.lost_packet_count as f32 / self.expected_packet_count as f32
        } else {
            0.0
        };

        self.last_jitter = other.last_jitter;
        self.min_jitter = self.min_jitter.min(other.min_jitter);
        self.max_jitter = self.max_jitter.max(other.max_jitter);

        self.started_at_millis = self.started_at_millis.min(other.started_at_millis);

        if self.call_id.is_none() {
            self.call_id = other.call_id.clone();
        }
        if self.codec_name.is_none() {
            self.codec_name = other.codec_name.clone();
        }
        if other.r_factor.is_some() {
            self.r_factor = other.r_factor;
            self.mos = other.mos;
        }
    }

    /// Snapshot document for the raw collections.
    pub fn document(&self) -> serde_json::Value {
        json!({
            "created_at": self.created_at_millis,
            "started_at": self.started_at_millis,
            "ssrc": self.ssrc,
            "payload_type": self.payload_type,
            "call_id": &self.call_id,
            "codec_name": &self.codec_name,
            "expected_packets": self.expected_packet_count,
            "received_packets": self.received_packet_count,
            "lost_packets": self.lost_packet_count,
            "rejected_packets": self.rejected_packet_count,
            "duration": self.duration_millis,
            "fraction_lost": self.fraction_lost,
            "last_jitter": self.last_jitter,
            "avg_jitter": self.avg_jitter,
            "min_jitter": self.min_jitter,
            "max_jitter": self.max_jitter,
            "r_factor": self.r_factor,
            "mos": self.mos,
        })
    }
}

pub mod wire {
    //! The encoding side of the report format.
    //!
    //! The core only decodes; the encoder mirrors the layout for capture
    //! agents and for the test suites.

    use bytes::{BufMut, BytesMut};

    use super::*;

    pub fn encode(report: &RtpReportPayload) -> bytes::Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + 64);
        buf.put_u8(match report.source {
            ReportSource::Rtp => 0,
            ReportSource::Rtcp => 1,
        });
        buf.put_u8(report.payload_type);
        buf.put_u8(if report.cumulative { FLAG_CUMULATIVE } else { 0 });
        buf.put_u8(0);
        buf.put_u32(report.ssrc);
        buf.put_u32(report.expected_packet_count);
        buf.put_u32(report.received_packet_count);
        buf.put_u32(report.lost_packet_count);
        buf.put_u32(report.rejected_packet_count);
        buf.put_u32(report.duration_millis);
        buf.put_f32(report.fraction_lost);
        buf.put_f32(report.last_jitter);
        buf.put_f32(report.avg_jitter);
        buf.put_f32(report.min_jitter);
        buf.put_f32(report.max_jitter);
        buf.put_i64(report.created_at_millis);
        buf.put_i64(report.started_at_millis);
        match &report.call_id {
            Some(call_id) => {
                buf.put_u16(call_id.len() as u16);
                buf.put_slice(call_id.as_bytes());
            }
            None => buf.put_u16(0),
        }
        buf.freeze()
    }

    pub fn sample(source: ReportSource) -> RtpReportPayload {
        RtpReportPayload {
            source,
            payload_type: 0,
            ssrc: 0x1234_5678,
            expected_packet_count: 100,
            received_packet_count: 98,
            lost_packet_count: 2,
            rejected_packet_count: 0,
            duration_millis: 2_000,
            fraction_lost: 0.02,
            last_jitter: 4.0,
            avg_jitter: 3.0,
            min_jitter: 1.0,
            max_jitter: 9.0,
            created_at_millis: 1_700_000_000_000,
            started_at_millis: 1_700_000_000_000,
            cumulative: false,
            call_id: None,
            codec_name: None,
            r_factor: None,
            mos: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        let mut report = wire::sample(ReportSource::Rtp);
        report.call_id = Some("abc@host".to_string());

        let decoded = RtpReportPayload::decode(wire::encode(&report)).unwrap();

        assert_eq!(decoded.source, ReportSource::Rtp);
        assert_eq!(decoded.ssrc, 0x1234_5678);
        assert_eq!(decoded.expected_packet_count, 100);
        assert_eq!(decoded.call_id.as_deref(), Some("abc@host"));
        assert!(!decoded.cumulative);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let report = wire::sample(ReportSource::Rtp);
        let encoded = wire::encode(&report);
        assert_matches!(
            RtpReportPayload::decode(&encoded[..FIXED_LEN - 1]),
            Err(Error::ReportParse(_))
        );
    }

    #[test]
    fn test_decode_flags_unknown_source_as_invariant() {
        let report = wire::sample(ReportSource::Rtp);
        let mut encoded = wire::encode(&report).to_vec();
        encoded[0] = 9;
        assert_matches!(
            RtpReportPayload::decode(&encoded[..]),
            Err(Error::UnknownReportSource(9))
        );
    }

    #[test]
    fn test_merge_is_count_weighted() {
        let mut left = wire::sample(ReportSource::Rtp);
        let mut right = wire::sample(ReportSource::Rtp);
        right.received_packet_count = 2 * left.received_packet_count;
        right.avg_jitter = 6.0;
        right.last_jitter = 8.5;
        right.min_jitter = 0.5;
        right.max_jitter = 20.0;
        right.lost_packet_count = 4;

        left.merge(&right);

        assert_eq!(left.expected_packet_count, 200);
        assert_eq!(left.received_packet_count, 294);
        assert_eq!(left.lost_packet_count, 6);
        // (3*98 + 6*196) / 294 = 5.0
        assert!((left.avg_jitter - 5.0).abs() < 1e-6, "{}", left.avg_jitter);
        assert_eq!(left.last_jitter, 8.5);
        assert_eq!(left.min_jitter, 0.5);
        assert_eq!(left.max_jitter, 20.0);
        assert!((left.fraction_lost - 0.03).abs() < 1e-6);
    }

    #[test]
    fn test_merge_identical_reports_scales_counts_only() {
        let mut acc = wire::sample(ReportSource::Rtp);
        let original = acc.clone();
        for _ in 0..4 {
            acc.merge(&original);
        }

        assert_eq!(acc.expected_packet_count, 5 * original.expected_packet_count);
        assert_eq!(acc.received_packet_count, 5 * original.received_packet_count);
        assert_eq!(acc.avg_jitter, original.avg_jitter);
        assert_eq!(acc.min_jitter, original.min_jitter);
        assert_eq!(acc.max_jitter, original.max_jitter);
    }
}
