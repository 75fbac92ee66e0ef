use std::collections::HashMap;

use crate::producer::Producer;
use crate::rtp::{Mid, Rid, RtpHeader, Ssrc};
use crate::SfuError;

/// Routes incoming RTP packets to the owning producer.
///
/// Resolution precedence: the MID header extension, then the RID
/// extension, then the learned SSRC table. A hit via MID or RID also
/// binds the packet's SSRC so later packets take the fast path.
#[derive(Debug, Default)]
pub struct RtpListener {
    ssrc_table: HashMap<Ssrc, String>,
    mid_table: HashMap<Mid, String>,
    rid_table: HashMap<Rid, String>,
}

impl RtpListener {
    pub fn new() -> Self {
        RtpListener::default()
    }

    /// Register a producer's identifiers.
    ///
    /// Fails without touching any table when an SSRC, MID or RID is
    /// already claimed by another producer.
    pub fn add_producer(&mut self, producer: &Producer) -> Result<(), SfuError> {
        let id = producer.id();

        // Validate everything before inserting anything.
        if let Some(mid) = producer.mid() {
            if let Some(other) = self.mid_table.get(&mid) {
                if other != id {
                    return Err(SfuError::Conflict(format!("mid already in use: {}", mid)));
                }
            }
        }

        for encoding in producer.encodings() {
            if let Some(ssrc) = encoding.ssrc {
                if let Some(other) = self.ssrc_table.get(&ssrc) {
                    if other != id {
                        return Err(SfuError::Conflict(format!("ssrc already in use: {}", ssrc)));
                    }
                }
            }
            if let Some(rid) = encoding.rid {
                if let Some(other) = self.rid_table.get(&rid) {
                    if other != id {
                        return Err(SfuError::Conflict(format!("rid already in use: {}", rid)));
                    }
                }
            }
        }

        if let Some(mid) = producer.mid() {
            self.mid_table.insert(mid, id.to_string());
        }

        for encoding in producer.encodings() {
            if let Some(ssrc) = encoding.ssrc {
                self.ssrc_table.insert(ssrc, id.to_string());
            }
            if let Some(rid) = encoding.rid {
                self.rid_table.insert(rid, id.to_string());
            }
        }

        Ok(())
    }

    /// Remove every table entry pointing at `producer_id`.
    pub fn remove_producer(&mut self, producer_id: &str) {
        self.ssrc_table.retain(|_, v| v != producer_id);
        self.mid_table.retain(|_, v| v != producer_id);
        self.rid_table.retain(|_, v| v != producer_id);
    }

    /// Resolve the producer for an incoming packet.
    ///
    /// Learns the SSRC binding on a MID/RID hit.
    pub fn resolve(&mut self, header: &RtpHeader) -> Option<String> {
        let ssrc = header.ssrc;

        if let Some(mid) = header.ext_vals.mid {
            if let Some(id) = self.mid_table.get(&mid) {
                let id = id.clone();
                self.ssrc_table.entry(ssrc).or_insert_with(|| id.clone());
                return Some(id);
            }
        }

        if let Some(rid) = header.ext_vals.rid {
            if let Some(id) = self.rid_table.get(&rid) {
                let id = id.clone();
                self.ssrc_table.entry(ssrc).or_insert_with(|| id.clone());
                return Some(id);
            }
        }

        self.ssrc_table.get(&ssrc).cloned()
    }

    /// Look up the producer owning an SSRC (used for RTCP SR routing).
    pub fn get_by_ssrc(&self, ssrc: Ssrc) -> Option<&str> {
        self.ssrc_table.get(&ssrc).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::producer::{MediaKind, ProducerOptions, RtpEncoding};
    use crate::rtp::ExtensionMap;

    fn producer(id: &str, ssrc: u32, mid: Option<&str>, rid: Option<&str>) -> Producer {
        Producer::new(
            id,
            ProducerOptions {
                kind: MediaKind::Video,
                mid: mid.map(Mid::from),
                encodings: vec![RtpEncoding {
                    ssrc: Some(ssrc.into()),
                    rid: rid.map(Rid::from),
                    mapped_ssrc: (ssrc + 1000).into(),
                }],
                payload_map: Default::default(),
                ext_map: ExtensionMap::standard(),
                clock_rate: 90_000,
                paused: false,
            },
        )
    }

    fn header(ssrc: u32, mid: Option<&str>, rid: Option<&str>) -> RtpHeader {
        let mut h = RtpHeader {
            ssrc: ssrc.into(),
            ..Default::default()
        };
        h.ext_vals.mid = mid.map(Mid::from);
        h.ext_vals.rid = rid.map(Rid::from);
        h
    }

    #[test]
    fn resolve_by_declared_ssrc() {
        let mut listener = RtpListener::new();
        let p = producer("p1", 100, None, None);
        listener.add_producer(&p).unwrap();

        assert_eq!(listener.resolve(&header(100, None, None)).as_deref(), Some("p1"));
        assert_eq!(listener.resolve(&header(999, None, None)), None);
    }

    #[test]
    fn resolve_by_mid_learns_ssrc() {
        let mut listener = RtpListener::new();
        let p = producer("p1", 100, Some("a"), None);
        listener.add_producer(&p).unwrap();

        // Undeclared SSRC, resolved via MID.
        assert_eq!(
            listener.resolve(&header(555, Some("a"), None)).as_deref(),
            Some("p1")
        );
        // Learned: resolves without the extension now.
        assert_eq!(listener.resolve(&header(555, None, None)).as_deref(), Some("p1"));
    }

    #[test]
    fn mid_takes_precedence_over_ssrc() {
        let mut listener = RtpListener::new();
        listener.add_producer(&producer("p1", 100, Some("a"), None)).unwrap();
        listener.add_producer(&producer("p2", 200, Some("b"), None)).unwrap();

        // Contradictory packet: ssrc of p2 but mid of p1.
        assert_eq!(
            listener.resolve(&header(200, Some("a"), None)).as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn conflicting_ssrc_is_rejected() {
        let mut listener = RtpListener::new();
        listener.add_producer(&producer("p1", 100, None, None)).unwrap();

        let r = listener.add_producer(&producer("p2", 100, None, None));
        assert!(matches!(r, Err(SfuError::Conflict(_))));
    }

    #[test]
    fn conflicting_mid_is_rejected() {
        let mut listener = RtpListener::new();
        listener.add_producer(&producer("p1", 100, Some("a"), None)).unwrap();

        let r = listener.add_producer(&producer("p2", 200, Some("a"), None));
        assert!(matches!(r, Err(SfuError::Conflict(_))));
    }

    #[test]
    fn remove_producer_clears_tables() {
        let mut listener = RtpListener::new();
        listener
            .add_producer(&producer("p1", 100, Some("a"), Some("r0")))
            .unwrap();

        listener.remove_producer("p1");

        assert_eq!(listener.resolve(&header(100, None, None)), None);
        assert_eq!(listener.resolve(&header(100, Some("a"), None)), None);
    }
}
