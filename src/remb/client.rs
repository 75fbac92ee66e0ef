use std::time::{Duration, Instant};

use crate::rate::RtpDataCounter;
use crate::rtp::Remb;

// Minimum spacing between bitrate events.
const EVENT_INTERVAL: Duration = Duration::from_secs(2);

// Silence longer than this resets the state to the initial bitrate.
const MAX_EVENT_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of digesting a REMB packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RembClientEvent {
    /// Headroom above the current usage, in bps.
    RemainingBitrate(u32),
    /// Usage exceeds the availability by this much, in bps.
    ExceedingBitrate(u32),
}

/// Send-side REMB consumer.
///
/// Tracks the bitrate the remote receiver reports as available, compares
/// it against the actually used egress bitrate, and tells the transport
/// whether to raise or lower consumer layers.
#[derive(Debug)]
pub struct RembClient {
    initial_available_bitrate: u32,
    available_bitrate: u32,
    remb_bitrate: u32,
    last_event_at: Option<Instant>,
    transmission: RtpDataCounter,
}

impl RembClient {
    pub fn new(initial_available_bitrate: u32) -> RembClient {
        RembClient {
            initial_available_bitrate,
            available_bitrate: initial_available_bitrate,
            remb_bitrate: 0,
            last_event_at: None,
            transmission: RtpDataCounter::default(),
        }
    }

    /// Count one sent packet toward the used bitrate.
    pub fn sent_rtp(&mut self, now: Instant, size: usize) {
        self.transmission.update(size, now);
    }

    /// Digest an incoming REMB packet.
    pub fn receive_remb_feedback(&mut self, now: Instant, remb: &Remb) -> Option<RembClientEvent> {
        // Stale state: restart from the initial bitrate and make the
        // next event fire soon.
        if !self.check_status(now) {
            self.last_event_at = Some(now - EVENT_INTERVAL / 2);
            return None;
        }

        if let Some(at) = self.last_event_at {
            if now.duration_since(at) < EVENT_INTERVAL {
                return None;
            }
        }

        self.last_event_at = Some(now);

        let previous_remb = self.remb_bitrate;
        self.remb_bitrate = remb.bitrate_bps() as u32;

        let trend = self.remb_bitrate as i64 - previous_remb as i64;
        let used_bitrate = self.transmission.bitrate(now);

        self.available_bitrate = self.remb_bitrate;

        // A low REMB with a rising trend is startup noise: trust the
        // configured initial bitrate instead.
        if self.remb_bitrate < self.initial_available_bitrate && trend > 0 {
            self.available_bitrate = self.initial_available_bitrate;
        }

        if self.available_bitrate >= used_bitrate {
            let remaining = self.available_bitrate - used_bitrate;

            debug!(
                "Usable bitrate [available:{}, used:{}, remaining:{}]",
                self.available_bitrate, used_bitrate, remaining
            );

            Some(RembClientEvent::RemainingBitrate(remaining))
        } else if trend > 0 && self.remb_bitrate > self.initial_available_bitrate {
            // Positive trend above the initial: assume the trend amount
            // is additionally usable.
            let remaining = trend as u32;
            self.available_bitrate += remaining;

            Some(RembClientEvent::RemainingBitrate(remaining))
        } else {
            let exceeding = used_bitrate - self.available_bitrate;

            debug!(
                "Exceeding bitrate [available:{}, used:{}, exceeding:{}]",
                self.available_bitrate, used_bitrate, exceeding
            );

            Some(RembClientEvent::ExceedingBitrate(exceeding))
        }
    }

    /// The current availability estimate.
    pub fn available_bitrate(&mut self, now: Instant) -> u32 {
        self.check_status(now);
        self.available_bitrate
    }

    fn check_status(&mut self, now: Instant) -> bool {
        let fresh = match self.last_event_at {
            Some(at) => now.duration_since(at) < MAX_EVENT_INTERVAL,
            None => false,
        };

        if !fresh {
            self.available_bitrate = self.initial_available_bitrate;
            self.remb_bitrate = 0;
        }

        fresh
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn remb(bitrate: f32) -> Remb {
        Remb {
            sender_ssrc: 1.into(),
            bitrate,
            ssrcs: vec![200],
        }
    }

    #[test]
    fn first_feedback_only_arms_the_clock() {
        let now = Instant::now();
        let mut client = RembClient::new(600_000);

        assert_eq!(client.receive_remb_feedback(now, &remb(1_000_000.0)), None);
    }

    #[test]
    fn event_interval_gates_events() {
        let now = Instant::now();
        let mut client = RembClient::new(600_000);

        client.receive_remb_feedback(now, &remb(1_000_000.0));

        // Half a second later: inside EVENT_INTERVAL after the armed
        // clock (now - 1s), so 1.5s elapsed > 1s... the armed clock
        // backdates by EVENT_INTERVAL/2, making the next event due after
        // one more second.
        let at = now + Duration::from_millis(500);
        assert_eq!(client.receive_remb_feedback(at, &remb(1_000_000.0)), None);

        let at = now + Duration::from_millis(1100);
        let event = client.receive_remb_feedback(at, &remb(1_000_000.0));
        assert!(matches!(event, Some(RembClientEvent::RemainingBitrate(_))));
    }

    #[test]
    fn exceeding_when_usage_above_availability() {
        let now = Instant::now();
        let mut client = RembClient::new(600_000);

        client.receive_remb_feedback(now, &remb(1_000_000.0));

        // Use ~2mbit/s.
        for i in 0..100u64 {
            client.sent_rtp(now + Duration::from_millis(i * 10), 2500);
        }

        let at = now + Duration::from_millis(1100);
        // Falling REMB (trend < 0) below usage.
        let event = client.receive_remb_feedback(at, &remb(900_000.0));

        // First accepted feedback sets remb from 0, so trend > 0: that
        // one reports remaining. The next, falling one reports exceeding.
        match event {
            Some(RembClientEvent::RemainingBitrate(_)) => {
                let at = at + Duration::from_secs(2);
                for i in 0..100u64 {
                    client.sent_rtp(at + Duration::from_millis(i * 10), 2500);
                }
                let at2 = at + Duration::from_millis(1100);
                let event = client.receive_remb_feedback(at2, &remb(800_000.0));
                assert!(
                    matches!(event, Some(RembClientEvent::ExceedingBitrate(_))),
                    "got {event:?}"
                );
            }
            Some(RembClientEvent::ExceedingBitrate(_)) => {}
            None => panic!("expected an event"),
        }
    }

    #[test]
    fn long_silence_resets_to_initial() {
        let now = Instant::now();
        let mut client = RembClient::new(600_000);

        client.receive_remb_feedback(now, &remb(5_000_000.0));
        let at = now + Duration::from_millis(1100);
        client.receive_remb_feedback(at, &remb(5_000_000.0));
        assert!(client.available_bitrate(at) > 600_000);

        // Six seconds of silence.
        let later = at + Duration::from_secs(6);
        assert_eq!(client.available_bitrate(later), 600_000);
    }

    #[test]
    fn low_remb_with_rising_trend_keeps_initial() {
        let now = Instant::now();
        let mut client = RembClient::new(600_000);

        client.receive_remb_feedback(now, &remb(100_000.0));

        // 200k < initial 600k, trend rising from 0.
        let at = now + Duration::from_millis(1100);
        client.receive_remb_feedback(at, &remb(200_000.0));

        assert_eq!(client.available_bitrate(at), 600_000);
    }
}
