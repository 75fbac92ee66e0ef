use std::time::Instant;

use crate::rtp::RtpPacket;

use super::{ConsumerOptions, ConsumerShared};

/// 1:1 forwarding of a single-encoding producer.
#[derive(Debug)]
pub struct SimpleConsumer {
    pub(crate) shared: ConsumerShared,
}

impl SimpleConsumer {
    pub(crate) fn new(id: &str, options: ConsumerOptions) -> SimpleConsumer {
        SimpleConsumer {
            shared: ConsumerShared::new(id, &options),
        }
    }

    /// Forward unconditionally, subject to pause.
    pub(crate) fn send_rtp(&mut self, now: Instant, packet: &RtpPacket) -> Option<RtpPacket> {
        self.shared.rewrite(now, packet)
    }
}

#[cfg(test)]
mod test {
    use super::super::{Consumer, ConsumerType};
    use super::*;
    use crate::producer::MediaKind;
    use crate::rtp::{ExtensionMap, ExtensionValues, RtpHeader};

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            kind: MediaKind::Video,
            consumer_type: ConsumerType::Simple,
            producer_id: "p1".into(),
            producer_ssrcs: vec![1100.into()],
            ssrc: 200.into(),
            payload_type: 102.into(),
            mid: Some("c".into()),
            ext_map: ExtensionMap::standard(),
            clock_rate: 90_000,
            paused: false,
            preferred_layer: None,
        }
    }

    fn packet(seq: u16, ts: u32, payload: &[u8]) -> RtpPacket {
        let exts = ExtensionMap::standard();
        let header = RtpHeader {
            payload_type: 101.into(),
            sequence_number: seq,
            timestamp: ts,
            ssrc: 1100.into(),
            ext_vals: ExtensionValues::default(),
            ..Default::default()
        };
        let mut buf = vec![0; 256];
        let n = header.write_to(&mut buf, &exts);
        buf.truncate(n);
        buf.extend_from_slice(payload);
        RtpPacket::parse(&buf, &exts).unwrap()
    }

    #[test]
    fn rewrites_egress_identity() {
        let now = Instant::now();
        let mut c = Consumer::new("c1", options());

        let out = c
            .send_rtp(now, &packet(1000, 90_000, &[7, 8, 9]), 0, false)
            .unwrap();

        assert_eq!(*out.ssrc(), 200);
        assert_eq!(*out.payload_type(), 102);
        assert_eq!(out.payload(), &[7, 8, 9]);
        assert_eq!(out.header().ext_vals.mid, Some("c".into()));
    }

    #[test]
    fn sequence_space_is_contiguous_over_pause() {
        let now = Instant::now();
        let mut c = Consumer::new("c1", options());

        let out1 = c.send_rtp(now, &packet(1000, 0, &[1]), 0, false).unwrap();

        c.pause();
        assert!(c.send_rtp(now, &packet(1001, 0, &[1]), 0, false).is_none());
        assert!(c.send_rtp(now, &packet(1002, 0, &[1]), 0, false).is_none());
        c.resume();

        let out2 = c.send_rtp(now, &packet(1003, 0, &[1]), 0, false).unwrap();

        // The two dropped packets are compacted away.
        let delta = out2.sequence_number().wrapping_sub(out1.sequence_number());
        assert_eq!(delta, 1);
    }

    #[test]
    fn producer_pause_also_stops_egress() {
        let now = Instant::now();
        let mut c = Consumer::new("c1", options());

        c.set_producer_paused(true);
        assert!(c.send_rtp(now, &packet(1, 0, &[1]), 0, false).is_none());

        c.set_producer_paused(false);
        assert!(c.send_rtp(now, &packet(2, 0, &[1]), 0, false).is_some());
    }

    #[test]
    fn payload_survives_byte_identical() {
        let now = Instant::now();
        let mut c = Consumer::new("c1", options());

        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let out = c
            .send_rtp(now, &packet(5, 1234, &payload), 0, false)
            .unwrap();

        assert_eq!(out.payload(), &payload[..]);
    }
}
