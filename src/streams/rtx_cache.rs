use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::rtp::{RtpPacket, SeqNo};

/// Oldest packet kept for retransmission.
pub(crate) const MAX_PACKET_AGE: Duration = Duration::from_secs(1);

/// Most packets kept for retransmission.
pub(crate) const MAX_PACKET_COUNT: usize = 512;

/// Cache of recently sent packets, serving incoming NACKs.
///
/// Entries are evicted both by age and by count. Packets are stored as
/// copies; the cache never borrows send buffers.
#[derive(Debug, Default)]
pub(crate) struct RtxCache {
    packets: BTreeMap<u64, (Instant, RtpPacket)>,
}

impl RtxCache {
    pub fn new() -> Self {
        RtxCache::default()
    }

    pub fn cache_sent_packet(&mut self, seq_no: SeqNo, packet: RtpPacket, now: Instant) {
        self.packets.insert(*seq_no, (now, packet));
        self.evict(now);
    }

    pub fn get(&self, seq_no: SeqNo) -> Option<&RtpPacket> {
        self.packets.get(&*seq_no).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    fn evict(&mut self, now: Instant) {
        while self.packets.len() > MAX_PACKET_COUNT {
            let oldest = *self.packets.keys().next().unwrap();
            self.packets.remove(&oldest);
        }

        let cutoff = now.checked_sub(MAX_PACKET_AGE);
        if let Some(cutoff) = cutoff {
            self.packets.retain(|_, (at, _)| *at >= cutoff);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::{ExtensionMap, RtpHeader};

    fn packet(seq: u16) -> RtpPacket {
        let header = RtpHeader {
            sequence_number: seq,
            ssrc: 1.into(),
            ..Default::default()
        };
        let mut buf = vec![0; 64];
        let n = header.write_to(&mut buf, &ExtensionMap::empty());
        buf.truncate(n);
        buf.extend_from_slice(&[1, 2, 3]);
        RtpPacket::parse(&buf, &ExtensionMap::empty()).unwrap()
    }

    #[test]
    fn get_cached() {
        let now = Instant::now();
        let mut cache = RtxCache::new();

        cache.cache_sent_packet(1000.into(), packet(1000), now);

        assert!(cache.get(1000.into()).is_some());
        assert!(cache.get(1001.into()).is_none());
    }

    #[test]
    fn evicts_by_count() {
        let now = Instant::now();
        let mut cache = RtxCache::new();

        for i in 0..(MAX_PACKET_COUNT as u64 + 100) {
            cache.cache_sent_packet(i.into(), packet(i as u16), now);
        }

        assert_eq!(cache.len(), MAX_PACKET_COUNT);
        assert!(cache.get(0.into()).is_none());
        assert!(cache.get(600.into()).is_some());
    }

    #[test]
    fn evicts_by_age() {
        let now = Instant::now();
        let mut cache = RtxCache::new();

        cache.cache_sent_packet(1.into(), packet(1), now);
        cache.cache_sent_packet(
            2.into(),
            packet(2),
            now + Duration::from_millis(1500),
        );

        assert!(cache.get(1.into()).is_none());
        assert!(cache.get(2.into()).is_some());
    }
}
