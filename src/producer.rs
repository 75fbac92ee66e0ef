use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::keyframe::KeyFrameRequestManager;
use crate::rtp::{ExtensionMap, Mid, Pt, ReceptionReport, Rid, RtpPacket, SenderInfo, Ssrc};
use crate::streams::RtpStreamRecv;

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Payload format of a producer, for keyframe detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Vp8,
    H264,
    Opus,
    #[default]
    Unknown,
}

/// One encoding (simulcast layer) of a producer.
#[derive(Debug, Clone)]
pub struct RtpEncoding {
    /// The SSRC as it appears on the wire, when declared up front.
    /// Learned from the first packet otherwise (requires a RID).
    pub ssrc: Option<Ssrc>,
    /// Stream identifier when the encoding is RID-addressed.
    pub rid: Option<Rid>,
    /// The stable SSRC this encoding maps to inside the router.
    pub mapped_ssrc: Ssrc,
}

/// Construction parameters for a [`Producer`].
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub mid: Option<Mid>,
    /// Ordered low to high (spatially) for simulcast.
    pub encodings: Vec<RtpEncoding>,
    /// Wire payload type to canonical payload type.
    pub payload_map: HashMap<Pt, Pt>,
    /// The producer's declared header extension ids.
    pub ext_map: ExtensionMap,
    pub clock_rate: u32,
    pub paused: bool,
}

/// Outcome of feeding a packet to [`Producer::receive_rtp`].
#[derive(Debug, Clone, Copy)]
pub struct ProducerReceive {
    /// Index into the producer's encodings.
    pub encoding_idx: usize,
    /// The stable SSRC the packet was rewritten to.
    pub mapped_ssrc: Ssrc,
    /// Whether the packet starts a decodable keyframe.
    pub is_keyframe: bool,
    /// False when the producer is paused: account, don't dispatch.
    pub forward: bool,
}

/// Per-source media state: stream statistics, payload/extension
/// normalization and the keyframe request machinery toward the remote.
#[derive(Debug)]
pub struct Producer {
    id: String,
    kind: MediaKind,
    codec: CodecKind,
    mid: Option<Mid>,
    encodings: Vec<RtpEncoding>,
    payload_map: HashMap<Pt, Pt>,
    ext_map: ExtensionMap,
    clock_rate: u32,
    paused: bool,
    /// Wire SSRC to (encoding index, stream state).
    streams: HashMap<Ssrc, (usize, RtpStreamRecv)>,
    keyframes: KeyFrameRequestManager,
    /// Last published score per encoding, for change detection.
    published_scores: Vec<u8>,
}

impl Producer {
    pub fn new(id: &str, options: ProducerOptions) -> Producer {
        let published_scores = vec![10; options.encodings.len()];
        Producer {
            id: id.to_string(),
            kind: options.kind,
            codec: CodecKind::Unknown,
            mid: options.mid,
            encodings: options.encodings,
            payload_map: options.payload_map,
            ext_map: options.ext_map,
            clock_rate: options.clock_rate,
            paused: options.paused,
            streams: HashMap::new(),
            keyframes: KeyFrameRequestManager::new(),
            published_scores,
        }
    }

    /// Set the payload format used for keyframe detection.
    pub fn set_codec(&mut self, codec: CodecKind) {
        self.codec = codec;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mid(&self) -> Option<Mid> {
        self.mid
    }

    pub fn encodings(&self) -> &[RtpEncoding] {
        &self.encodings
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pause dispatch. Returns whether the state changed.
    pub fn pause(&mut self) -> bool {
        let changed = !self.paused;
        self.paused = true;
        changed
    }

    /// Resume dispatch. Returns whether the state changed.
    pub fn resume(&mut self) -> bool {
        let changed = self.paused;
        self.paused = false;
        changed
    }

    /// Feed one incoming packet.
    ///
    /// Updates stream statistics, normalizes payload type, SSRC and
    /// extension ids in place, and reports how the transport should
    /// dispatch it. `None` means the packet does not belong to any
    /// encoding of this producer.
    pub fn receive_rtp(
        &mut self,
        now: Instant,
        packet: &mut RtpPacket,
        transport_exts: &ExtensionMap,
    ) -> Option<ProducerReceive> {
        let wire_ssrc = packet.ssrc();
        let encoding_idx = self.encoding_for(packet)?;

        let clock_rate = self.clock_rate;
        let entry = self
            .streams
            .entry(wire_ssrc)
            .or_insert_with(|| (encoding_idx, RtpStreamRecv::new(wire_ssrc, clock_rate)));

        entry.1.receive(now, packet);

        let is_keyframe = self.kind == MediaKind::Video && is_keyframe(self.codec, packet);
        if is_keyframe {
            self.keyframes.key_frame_received(wire_ssrc);
        }

        let mapped_ssrc = self.encodings[encoding_idx].mapped_ssrc;

        // Normalize for the router side: canonical PT, mapped SSRC,
        // transport-wide extension ids.
        if let Some(canonical) = self.payload_map.get(&packet.payload_type()) {
            packet.set_payload_type(*canonical);
        }
        packet.set_ssrc(mapped_ssrc);

        if *transport_exts != self.ext_map {
            packet.rewrite_extensions(packet.header().ext_vals, transport_exts);
        }

        Some(ProducerReceive {
            encoding_idx,
            mapped_ssrc,
            is_keyframe,
            forward: !self.paused,
        })
    }

    // Match a packet to an encoding by declared SSRC, then RID (learning
    // the SSRC), then single-encoding fallback.
    fn encoding_for(&mut self, packet: &RtpPacket) -> Option<usize> {
        let wire_ssrc = packet.ssrc();

        if let Some(idx) = self
            .encodings
            .iter()
            .position(|e| e.ssrc == Some(wire_ssrc))
        {
            return Some(idx);
        }

        if let Some(rid) = packet.header().ext_vals.rid {
            if let Some(idx) = self.encodings.iter().position(|e| e.rid == Some(rid)) {
                self.encodings[idx].ssrc = Some(wire_ssrc);
                return Some(idx);
            }
        }

        if self.encodings.len() == 1 && self.encodings[0].ssrc.is_none() {
            self.encodings[0].ssrc = Some(wire_ssrc);
            return Some(0);
        }

        None
    }

    /// A consumer wants a keyframe for `mapped_ssrc`.
    ///
    /// Returns the wire SSRC to address a PLI to, when one should be
    /// emitted now. Audio producers ignore this.
    pub fn request_key_frame(&mut self, now: Instant, mapped_ssrc: Ssrc) -> Option<Ssrc> {
        if self.kind != MediaKind::Video {
            return None;
        }

        let wire_ssrc = self
            .encodings
            .iter()
            .find(|e| e.mapped_ssrc == mapped_ssrc)
            .and_then(|e| e.ssrc)?;

        if self.keyframes.key_frame_needed(now, wire_ssrc) {
            Some(wire_ssrc)
        } else {
            None
        }
    }

    /// Next keyframe retry deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.keyframes.poll_timeout()
    }

    /// Fire keyframe retry watchdogs. Returns wire SSRCs to re-PLI.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Ssrc> {
        self.keyframes.handle_timeout(now)
    }

    /// Route a sender report to the right stream.
    pub fn receive_sender_report(&mut self, now: Instant, info: &SenderInfo) {
        if let Some((_, stream)) = self.streams.get_mut(&info.ssrc) {
            stream.receive_sender_report(now, info);
        }
    }

    /// Collect reception report blocks for all active streams.
    pub fn get_rtcp(&mut self, now: Instant) -> Vec<ReceptionReport> {
        self.streams
            .values_mut()
            .filter_map(|(_, stream)| stream.reception_report(now))
            .collect()
    }

    /// NACKs due toward the remote sender.
    pub fn nack_reports(&mut self) -> Vec<crate::rtp::Nack> {
        self.streams
            .values_mut()
            .flat_map(|(_, stream)| stream.nack_reports())
            .collect()
    }

    /// Score changes since the last call: (encoding idx, mapped SSRC,
    /// new score).
    pub fn take_score_changes(&mut self) -> Vec<(usize, Ssrc, u8)> {
        let mut changes = vec![];

        for (idx_ref, stream) in self.streams.values() {
            let idx = *idx_ref;
            let score = stream.score();
            if self.published_scores[idx] != score {
                changes.push((idx, self.encodings[idx].mapped_ssrc, score));
            }
        }

        for (idx, _, score) in &changes {
            self.published_scores[*idx] = *score;
        }

        changes
    }

    /// Score of one encoding, 0 when its stream never started.
    pub fn encoding_score(&self, encoding_idx: usize) -> u8 {
        self.streams
            .values()
            .find(|(idx, _)| *idx == encoding_idx)
            .map(|(_, s)| s.score())
            .unwrap_or(0)
    }

    /// Incoming bitrate of one encoding.
    pub fn encoding_bitrate(&mut self, encoding_idx: usize, now: Instant) -> u32 {
        self.streams
            .values_mut()
            .find(|(idx, _)| *idx == encoding_idx)
            .map(|(_, s)| s.bitrate(now))
            .unwrap_or(0)
    }

    /// Snapshot for `producer.dump`.
    pub fn dump(&self) -> ProducerDump {
        ProducerDump {
            id: self.id.clone(),
            kind: self.kind,
            paused: self.paused,
            mid: self.mid.map(|m| m.to_string()),
            encodings: self
                .encodings
                .iter()
                .map(|e| EncodingDump {
                    ssrc: e.ssrc.map(|s| *s),
                    rid: e.rid.map(|r| r.to_string()),
                    mapped_ssrc: *e.mapped_ssrc,
                })
                .collect(),
        }
    }

    /// Snapshot for `producer.getStats`.
    pub fn stats(&mut self, now: Instant) -> Vec<ProducerStat> {
        let mut stats: Vec<ProducerStat> = self
            .streams
            .values_mut()
            .map(|(idx, stream)| ProducerStat {
                ssrc: *stream.ssrc(),
                mapped_ssrc: 0, // filled below
                encoding_idx: *idx,
                packets: stream.packets(),
                bytes: stream.bytes(),
                bitrate: stream.bitrate(now),
                score: stream.score(),
            })
            .collect();

        for stat in &mut stats {
            stat.mapped_ssrc = *self.encodings[stat.encoding_idx].mapped_ssrc;
        }

        stats.sort_by_key(|s| s.encoding_idx);
        stats
    }

    /// Total received bytes across streams (test and stats helper).
    pub fn bytes_received(&self) -> u64 {
        self.streams.values().map(|(_, s)| s.bytes()).sum()
    }
}

/// Serialized producer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDump {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub mid: Option<String>,
    pub encodings: Vec<EncodingDump>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingDump {
    pub ssrc: Option<u32>,
    pub rid: Option<String>,
    pub mapped_ssrc: u32,
}

/// Per-stream statistics snapshot.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStat {
    pub ssrc: u32,
    pub mapped_ssrc: u32,
    #[serde(skip)]
    pub encoding_idx: usize,
    pub packets: u64,
    pub bytes: u64,
    pub bitrate: u32,
    pub score: u8,
}

// Keyframe probing. VP8 and H264 payload descriptors are parsed just
// enough to find the keyframe bit; the frame-marking extension is used
// when present.
fn is_keyframe(codec: CodecKind, packet: &RtpPacket) -> bool {
    if let Some(marking) = packet.header().ext_vals.frame_marking {
        // S (start) and I (independent) bits.
        return marking & 0x80 > 0 && marking & 0x20 > 0;
    }

    let payload = packet.payload();

    match codec {
        CodecKind::Vp8 => is_vp8_keyframe(payload),
        CodecKind::H264 => is_h264_keyframe(payload),
        _ => false,
    }
}

fn is_vp8_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }

    let b0 = payload[0];

    // S bit: start of VP8 partition, PID must be 0.
    if b0 & 0x10 == 0 || b0 & 0x07 != 0 {
        return false;
    }

    let mut idx = 1;

    // X: extension byte present.
    if b0 & 0x80 > 0 {
        if payload.len() <= idx {
            return false;
        }
        let b1 = payload[idx];
        idx += 1;

        // I: picture id, one or two bytes.
        if b1 & 0x80 > 0 {
            if payload.len() <= idx {
                return false;
            }
            idx += if payload[idx] & 0x80 > 0 { 2 } else { 1 };
        }
        // L: tl0picidx.
        if b1 & 0x40 > 0 {
            idx += 1;
        }
        // T/K: tid/keyidx.
        if b1 & 0x30 > 0 {
            idx += 1;
        }
    }

    if payload.len() <= idx {
        return false;
    }

    // P bit of the VP8 payload header: 0 means keyframe.
    payload[idx] & 0x01 == 0
}

fn is_h264_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }

    let nal_type = payload[0] & 0x1f;

    match nal_type {
        // IDR or SPS.
        5 | 7 => true,
        // STAP-A: scan aggregated NALs.
        24 => {
            let mut buf = &payload[1..];
            while buf.len() >= 3 {
                let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                let nal = buf[2] & 0x1f;
                if nal == 5 || nal == 7 {
                    return true;
                }
                if buf.len() < 2 + size {
                    break;
                }
                buf = &buf[2 + size..];
            }
            false
        }
        // FU-A: start fragment of an IDR.
        28 => payload.len() > 1 && payload[1] & 0x80 > 0 && payload[1] & 0x1f == 5,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::{ExtensionValues, RtpHeader};

    fn options(ssrc: u32) -> ProducerOptions {
        ProducerOptions {
            kind: MediaKind::Video,
            mid: Some("a".into()),
            encodings: vec![RtpEncoding {
                ssrc: Some(ssrc.into()),
                rid: None,
                mapped_ssrc: (ssrc + 1000).into(),
            }],
            payload_map: [(96.into(), 101.into())].into(),
            ext_map: ExtensionMap::standard(),
            clock_rate: 90_000,
            paused: false,
        }
    }

    fn packet(ssrc: u32, seq: u16, payload: &[u8]) -> RtpPacket {
        let exts = ExtensionMap::standard();
        let header = RtpHeader {
            payload_type: 96.into(),
            sequence_number: seq,
            ssrc: ssrc.into(),
            ext_vals: ExtensionValues {
                mid: Some("a".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut buf = vec![0; 256];
        let n = header.write_to(&mut buf, &exts);
        buf.truncate(n);
        buf.extend_from_slice(payload);
        RtpPacket::parse(&buf, &exts).unwrap()
    }

    #[test]
    fn normalizes_pt_and_ssrc() {
        let now = Instant::now();
        let mut p = Producer::new("p1", options(100));
        let exts = ExtensionMap::standard();

        let mut pkt = packet(100, 1000, &[1, 2, 3]);
        let recv = p.receive_rtp(now, &mut pkt, &exts).unwrap();

        assert_eq!(recv.encoding_idx, 0);
        assert_eq!(*recv.mapped_ssrc, 1100);
        assert!(recv.forward);

        assert_eq!(*pkt.ssrc(), 1100);
        assert_eq!(*pkt.payload_type(), 101);
    }

    #[test]
    fn unknown_ssrc_is_rejected() {
        let now = Instant::now();
        let mut p = Producer::new("p1", options(100));
        let exts = ExtensionMap::standard();

        // Different ssrc and a mid that is not matched at this level
        // (the listener resolves mids; the producer matches encodings).
        let mut pkt = packet(9999, 1, &[1]);
        // Single encoding with declared ssrc: no match.
        assert!(p.receive_rtp(now, &mut pkt, &exts).is_none());
    }

    #[test]
    fn paused_producer_accounts_but_does_not_forward() {
        let now = Instant::now();
        let mut p = Producer::new("p1", options(100));
        let exts = ExtensionMap::standard();
        p.pause();

        let mut pkt = packet(100, 1000, &[1, 2, 3]);
        let recv = p.receive_rtp(now, &mut pkt, &exts).unwrap();

        assert!(!recv.forward);
        assert!(p.bytes_received() > 0);
    }

    #[test]
    fn keyframe_request_dedupes_and_maps_ssrc() {
        let now = Instant::now();
        let mut p = Producer::new("p1", options(100));
        let exts = ExtensionMap::standard();

        // Stream must exist (ssrc learned) for requests to resolve.
        let mut pkt = packet(100, 1, &[1]);
        p.receive_rtp(now, &mut pkt, &exts).unwrap();

        assert_eq!(p.request_key_frame(now, 1100.into()), Some(100.into()));
        // Debounced.
        assert_eq!(p.request_key_frame(now, 1100.into()), None);
    }

    #[test]
    fn vp8_keyframe_detection() {
        let mut p = Producer::new("p1", options(100));
        p.set_codec(CodecKind::Vp8);
        let exts = ExtensionMap::standard();
        let now = Instant::now();

        // S bit set, no extensions, P bit 0 -> keyframe.
        let mut key = packet(100, 1, &[0x10, 0x00, 0x9d, 0x01, 0x2a]);
        let recv = p.receive_rtp(now, &mut key, &exts).unwrap();
        assert!(recv.is_keyframe);

        // P bit 1 -> interframe.
        let mut delta = packet(100, 2, &[0x10, 0x01, 0x9d, 0x01, 0x2a]);
        let recv = p.receive_rtp(now, &mut delta, &exts).unwrap();
        assert!(!recv.is_keyframe);
    }

    #[test]
    fn h264_keyframe_detection() {
        assert!(is_h264_keyframe(&[0x65, 0x88])); // IDR
        assert!(is_h264_keyframe(&[0x67, 0x42])); // SPS
        assert!(!is_h264_keyframe(&[0x61, 0x9a])); // non-IDR slice
        assert!(is_h264_keyframe(&[0x7c, 0x85, 0x88])); // FU-A start of IDR
        assert!(!is_h264_keyframe(&[0x7c, 0x05, 0x88])); // FU-A continuation
    }

    #[test]
    fn rid_learns_wire_ssrc() {
        let now = Instant::now();
        let mut opts = options(100);
        opts.encodings[0].ssrc = None;
        opts.encodings[0].rid = Some("r0".into());
        let mut p = Producer::new("p1", opts);
        let exts = ExtensionMap::standard();

        let header = RtpHeader {
            ssrc: 777.into(),
            ext_vals: ExtensionValues {
                rid: Some("r0".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut buf = vec![0; 128];
        let n = header.write_to(&mut buf, &exts);
        buf.truncate(n);
        buf.push(0);
        let mut pkt = RtpPacket::parse(&buf, &exts).unwrap();

        let recv = p.receive_rtp(now, &mut pkt, &exts).unwrap();
        assert_eq!(recv.encoding_idx, 0);
        assert_eq!(p.encodings()[0].ssrc, Some(777.into()));
    }
}
