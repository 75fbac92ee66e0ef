use std::time::{Duration, Instant};

use crate::rtp::TransportFeedback;
use crate::util::epoch_millis;

// Cadence of periodic feedback emission.
const FEEDBACK_INTERVAL: Duration = Duration::from_millis(100);

// Upper bound for one feedback packet on the wire.
const MAX_FEEDBACK_LEN: usize = 1200;

/// Receive-side transport-wide feedback production.
///
/// Every incoming packet carrying a wide sequence number is added to the
/// current feedback packet. When the builder refuses a pair (gap, delta
/// or size overflow) the current packet is emitted and a successor takes
/// over, seeded with the last accepted pair as pre-base. A 100 ms timer
/// flushes whatever is pending.
#[derive(Debug)]
pub struct TccServer {
    feedback: TransportFeedback,
    feedback_count: u8,
    next_emit: Option<Instant>,
}

impl TccServer {
    pub fn new() -> TccServer {
        let mut feedback = TransportFeedback::new();
        feedback.feedback_count = 0;

        TccServer {
            feedback,
            feedback_count: 0,
            next_emit: None,
        }
    }

    /// Start the periodic timer.
    pub fn transport_connected(&mut self, now: Instant) {
        self.next_emit = Some(now + FEEDBACK_INTERVAL);
    }

    /// Stop the periodic timer.
    pub fn transport_disconnected(&mut self) {
        self.next_emit = None;
    }

    /// Feed one received packet's wide sequence number.
    ///
    /// Returns a feedback packet when one had to be emitted to make room.
    pub fn incoming_packet(&mut self, now: Instant, wide_seq: u16) -> Option<TransportFeedback> {
        let arrival_ms = epoch_millis(now);

        let mut emitted = None;

        if !self.feedback.add_packet(wide_seq, arrival_ms, MAX_FEEDBACK_LEN) {
            trace!("Feedback packet full, emitting now");
            emitted = self.emit();

            // The refused pair opens the successor packet.
            self.feedback
                .add_packet(wide_seq, arrival_ms, MAX_FEEDBACK_LEN);
        }

        if self.feedback.is_full() {
            if emitted.is_none() {
                emitted = self.emit();
            } else {
                // Extremely unlikely: both rotation and fill in one call.
                self.emit();
            }
        }

        emitted
    }

    /// Next periodic emission deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_emit
    }

    /// Fire the periodic timer. Returns the feedback to send, if any.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<TransportFeedback> {
        let next = self.next_emit?;
        if now < next {
            return None;
        }
        self.next_emit = Some(now + FEEDBACK_INTERVAL);

        self.emit()
    }

    fn emit(&mut self) -> Option<TransportFeedback> {
        if !self.feedback.is_serializable() {
            return None;
        }

        let last = self.feedback.last_received();

        let mut out = std::mem::take(&mut self.feedback);
        out.finalize();
        out.feedback_count = self.feedback_count;

        self.feedback_count = self.feedback_count.wrapping_add(1);

        // Seed the successor with the last accepted pair as pre-base so
        // the sequence coverage is continuous across packets.
        if let Some((seq, ts)) = last {
            self.feedback.add_packet(seq, ts, MAX_FEEDBACK_LEN);
        }

        Some(out)
    }
}

impl Default for TccServer {
    fn default() -> Self {
        TccServer::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::PacketStatus;

    #[test]
    fn periodic_emission() {
        let start = Instant::now();
        let mut server = TccServer::new();
        server.transport_connected(start);

        for i in 0..5u16 {
            let now = start + Duration::from_millis(i as u64 * 10);
            assert!(server.incoming_packet(now, i).is_none());
        }

        let deadline = server.poll_timeout().unwrap();
        let fb = server.handle_timeout(deadline).expect("feedback due");

        let received: Vec<u16> = fb
            .iter()
            .filter(|(_, s, _)| *s != PacketStatus::NotReceived)
            .map(|(seq, _, _)| seq)
            .collect();

        // The first pair is the pre-base and not represented.
        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[test]
    fn nothing_to_emit_before_base() {
        let start = Instant::now();
        let mut server = TccServer::new();
        server.transport_connected(start);

        // Only the pre-base seen.
        server.incoming_packet(start, 0);

        let deadline = server.poll_timeout().unwrap();
        assert!(server.handle_timeout(deadline).is_none());
    }

    #[test]
    fn rotation_on_oversized_delta() {
        let start = Instant::now();
        let mut server = TccServer::new();
        server.transport_connected(start);

        server.incoming_packet(start, 0);
        server.incoming_packet(start + Duration::from_millis(10), 1);
        server.incoming_packet(start + Duration::from_millis(20), 2);

        // 9 seconds gap exceeds the representable delta: rotation.
        let late = start + Duration::from_secs(9);
        let emitted = server.incoming_packet(late, 3);

        let fb = emitted.expect("rotation emitted the old packet");
        let received: Vec<u16> = fb
            .iter()
            .filter(|(_, s, _)| *s != PacketStatus::NotReceived)
            .map(|(seq, _, _)| seq)
            .collect();
        assert_eq!(received, vec![1, 2]);

        // The refused pair seeds the successor, whose base it becomes
        // once the following packet arrives.
        server.incoming_packet(late + Duration::from_millis(5), 4);
        let deadline = server.poll_timeout().unwrap();
        let next = server.handle_timeout(deadline + Duration::from_secs(9)).unwrap();
        assert_eq!(next.feedback_count, 1);
    }

    #[test]
    fn feedback_counts_increase() {
        let start = Instant::now();
        let mut server = TccServer::new();
        server.transport_connected(start);

        let mut counts = vec![];
        for round in 0..3u64 {
            for i in 0..5u16 {
                let now = start + Duration::from_millis(round * 100 + i as u64 * 10);
                server.incoming_packet(now, (round * 5 + i as u64) as u16);
            }
            let deadline = server.poll_timeout().unwrap();
            if let Some(fb) = server.handle_timeout(deadline) {
                counts.push(fb.feedback_count);
            }
        }

        assert_eq!(counts, vec![0, 1, 2]);
    }
}
