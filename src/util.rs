use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// An `Instant` in the past, usable as "before anything we will compare to".
pub(crate) fn already_happened() -> Instant {
    const HOURS_1: Duration = Duration::from_secs(60 * 60);
    static PAST: Lazy<Instant> = Lazy::new(|| Instant::now().checked_sub(HOURS_1).unwrap());
    *PAST
}

pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for Option<Instant> {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

/// Milliseconds since the crate-wide time anchor.
///
/// Several wire formats (abs-send-time, transport-wide feedback reference
/// time) want absolute millisecond timestamps. We derive them from a fixed
/// anchor so they are stable within the process.
pub(crate) fn epoch_millis(now: Instant) -> u64 {
    now.duration_since(already_happened()).as_millis() as u64
}

// Arbitrary NTP era anchor. RTCP only ever compares NTP values produced
// within the same process, so the absolute value does not matter.
const NTP_BASE_SECS: u64 = 3_900_000_000;

/// Duration since the NTP epoch for `now`.
pub(crate) fn ntp_now(now: Instant) -> Duration {
    Duration::from_secs(NTP_BASE_SECS) + now.duration_since(already_happened())
}

/// The 64 bit NTP timestamp (32.32 fixed point) for `now`.
pub(crate) fn ntp_64(now: Instant) -> u64 {
    let d = ntp_now(now);
    let frac = (d.subsec_nanos() as u64) << 32;
    (d.as_secs() << 32) | (frac / 1_000_000_000)
}

/// Round trip time from RTCP report fields per RFC 3550 6.4.1.
///
/// * `ntp_now` NTP time of the report arrival (duration since NTP epoch).
/// * `last_sr` middle 32 bits of the NTP timestamp of the last SR.
/// * `delay` delay since last SR in 1/65536 seconds.
pub(crate) fn calculate_rtt_ms(ntp_now: Duration, last_sr: u32, delay: u32) -> Option<f32> {
    let now_secs = ntp_now.as_secs() as u32;
    let now_frac = ((ntp_now.subsec_nanos() as u64 * u32::MAX as u64) / 1_000_000_000) as u32;
    let now = (now_secs << 16) | (now_frac >> 16);

    let rtt = now.checked_sub(delay)?.checked_sub(last_sr)?;

    let secs = rtt >> 16;
    let frac = (rtt & 0xffff) as f32 / 65_536.0;

    Some(secs as f32 * 1000.0 + frac * 1000.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anchors_are_stable() {
        assert_eq!(already_happened(), already_happened());
        assert!(already_happened() < Instant::now());
    }

    #[test]
    fn soonest_picks_minimum() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(Some(now).soonest(Some(later)), Some(now));
        assert_eq!(None.soonest(Some(later)), Some(later));
        assert_eq!(Some(now).soonest(None), Some(now));
        assert_eq!(None.soonest(None), None);
    }

    #[test]
    fn rtt_from_report_fields() {
        // 5 seconds of network round trip, expressed in NTP 16.16.
        let ntp_now = Duration::from_secs(50_000);
        let last_sr = ((49_990u32) << 16) | 0;
        let delay = 5 << 16;

        let rtt = calculate_rtt_ms(ntp_now, last_sr, delay).unwrap();
        assert!((rtt - 5000.0).abs() < 1.0);
    }
}
