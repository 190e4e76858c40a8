//! Media quality pipeline.
//!
//! Capture agents summarize RTP/RTCP streams into RTP report packets;
//! [`session`] pairs the reports into direction-agnostic sessions, enriches
//! them with SDP negotiated in signaling ([`sdp`]) and derives E-model
//! quality scores.

pub mod report;
pub mod sdp;
pub mod session;

/// Default E-model transmission rating.
pub(crate) const R0: f32 = 93.2;

/// Standard E-model mapping from R-factor to MOS, clamped to `[1, 4.5]`.
pub(crate) fn compute_mos(r_factor: f32) -> f32 {
    if r_factor <= 0.0 {
        return 1.0;
    }
    if r_factor >= 100.0 {
        return 4.5;
    }
    let mos = 1.0 + 0.035 * r_factor + r_factor * (r_factor - 60.0) * (100.0 - r_factor) * 7e-6;
    mos.clamp(1.0, 4.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mos_bounds() {
        assert_eq!(compute_mos(-10.0), 1.0);
        assert_eq!(compute_mos(0.0), 1.0);
        assert_eq!(compute_mos(120.0), 4.5);
        let mos = compute_mos(R0);
        assert!(mos > 4.3 && mos <= 4.5, "{mos}");
    }

    #[test]
    fn test_mos_monotonic_over_typical_range() {
        let mut last = 0.0;
        for r in [10.0_f32, 30.0, 50.0, 70.0, 90.0] {
            let mos = compute_mos(r);
            assert!(mos >= last, "MOS should not decrease, r={r}");
            last = mos;
        }
    }
}
