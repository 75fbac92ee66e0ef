#![allow(clippy::unusual_byte_groupings)]

use std::collections::VecDeque;

mod header;
pub use header::{FeedbackMessageType, PayloadType, RtcpHeader, RtcpType, TransportType};

mod list;
pub use list::ReportList;

mod sr;
pub use sr::{SenderInfo, SenderReport};

mod rr;
pub use rr::{ReceiverReport, ReceptionReport};

mod sdes;
pub use sdes::{Descriptions, Sdes, SdesType};

mod bye;
pub use bye::Goodbye;

mod pli;
pub use pli::Pli;

mod fir;
pub use fir::{Fir, FirEntry};

mod nack;
pub use nack::{Nack, NackEntry};

mod remb;
pub use remb::Remb;

mod twcc;
pub use twcc::{PacketChunk, PacketStatus, TransportFeedback};
pub use twcc::{MAX_MISSING_PACKETS, MAX_PACKET_DELTA, MAX_PACKET_STATUS_COUNT};

use super::extend_u16;
use super::SeqNo;
use super::Ssrc;

/// Serialized form shared by all RTCP sub-packets.
pub trait RtcpPacket {
    /// The common header this packet starts with.
    fn header(&self) -> RtcpHeader;

    /// Length of the entire packet (header included) in 32-bit words.
    fn length_words(&self) -> usize;

    /// Write this packet to the buffer. The buffer must hold at least
    /// `length_words() * 4` bytes.
    fn write_to(&self, buf: &mut [u8]) -> usize;
}

/// Any RTCP sub-packet the SFU understands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rtcp {
    /// Sender report (SR).
    SenderReport(SenderReport),
    /// Receiver report (RR).
    ReceiverReport(ReceiverReport),
    /// Source description (SDES).
    SourceDescription(Descriptions),
    /// BYE.
    Goodbye(Goodbye),
    /// Missing packet report.
    Nack(Nack),
    /// Picture loss indication.
    Pli(Pli),
    /// Full intra request.
    Fir(Fir),
    /// Transport-wide congestion control feedback.
    TransportFeedback(TransportFeedback),
    /// Receiver estimated maximum bitrate.
    Remb(Remb),
}

impl Rtcp {
    /// Parse a compound packet, appending recognized sub-packets.
    ///
    /// Walks the buffer until exhaustion. Unknown or malformed
    /// sub-packets are skipped with a log.
    pub fn read_packet(buf: &[u8], out: &mut VecDeque<Rtcp>) {
        let mut buf = buf;

        loop {
            if buf.is_empty() {
                break;
            }

            let header: RtcpHeader = match buf.try_into() {
                Ok(v) => v,
                Err(e) => {
                    debug!("{}", e);
                    break;
                }
            };

            let has_padding = buf[0] & 0b00_1_00000 > 0;
            let full_length = header.length_words() * 4;

            if full_length > buf.len() {
                debug!("RTCP length field exceeds buffer");
                break;
            }

            let unpadded_length = if has_padding {
                let pad = buf[full_length - 1] as usize;
                if full_length < 4 + pad {
                    debug!("RTCP padding larger than packet: {}", pad);
                    break;
                }
                full_length - pad
            } else {
                full_length
            };

            match (&buf[..unpadded_length]).try_into() {
                Ok(v) => out.push_back(v),
                Err(e) => debug!("{}", e),
            }

            buf = &buf[full_length..];
        }
    }

    /// Pack and serialize queued feedback into `buf`.
    ///
    /// Reports of the same kind are merged (RR blocks stack into SR, etc.)
    /// and as many sub-packets as fit are written. Packets not fitting
    /// stay in the queue for a later flush.
    pub fn write_packet(feedback: &mut VecDeque<Rtcp>, buf: &mut [u8]) -> usize {
        if feedback.is_empty() {
            return 0;
        }

        let word_capacity = buf.len() / 4;

        Rtcp::pack(feedback, word_capacity);

        let mut offset = 0;

        while let Some(fb) = feedback.front() {
            let item_len = fb.length_words() * 4;

            if buf.len() - offset < item_len {
                break;
            }

            let fb = feedback.pop_front().unwrap();
            let written = fb.write_to(&mut buf[offset..]);

            // Padding can make the written amount exceed length_words.
            debug_assert!(written >= item_len, "sub-packet wrote less than declared");

            offset += written;
        }

        offset
    }

    fn merge(&mut self, other: &mut Rtcp, words_left: usize) -> bool {
        match (self, other) {
            // Stack receiver reports into sender reports.
            (Rtcp::SenderReport(sr), Rtcp::ReceiverReport(rr)) => {
                sr.reports.append_all_possible(&mut rr.reports, words_left) > 0
            }

            (Rtcp::ReceiverReport(r1), Rtcp::ReceiverReport(r2)) => {
                r1.reports.append_all_possible(&mut r2.reports, words_left) > 0
            }

            (Rtcp::SourceDescription(s1), Rtcp::SourceDescription(s2)) => {
                s1.reports.append_all_possible(&mut s2.reports, words_left) > 0
            }

            (Rtcp::Goodbye(g1), Rtcp::Goodbye(g2)) => {
                g1.reports.append_all_possible(&mut g2.reports, words_left) > 0
            }

            (Rtcp::Nack(n1), Rtcp::Nack(n2)) if n1.ssrc == n2.ssrc => {
                n1.reports.append_all_possible(&mut n2.reports, words_left) > 0
            }

            (Rtcp::Fir(f1), Rtcp::Fir(f2)) => {
                f1.reports.append_all_possible(&mut f2.reports, words_left) > 0
            }

            _ => false,
        }
    }

    fn is_full(&self) -> bool {
        match self {
            Rtcp::SenderReport(v) => v.reports.is_full(),
            Rtcp::ReceiverReport(v) => v.reports.is_full(),
            Rtcp::SourceDescription(v) => v.reports.is_full(),
            Rtcp::Goodbye(v) => v.reports.is_full(),
            Rtcp::Nack(v) => v.reports.is_full(),
            Rtcp::Pli(_) => true,
            Rtcp::Fir(v) => v.reports.is_full(),
            Rtcp::TransportFeedback(_) => true,
            Rtcp::Remb(_) => true,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            // A SenderReport always has the sender info block.
            Rtcp::SenderReport(_) => false,
            Rtcp::ReceiverReport(v) => v.reports.is_empty(),
            Rtcp::SourceDescription(v) => v.reports.is_empty(),
            Rtcp::Goodbye(v) => v.reports.is_empty(),
            Rtcp::Nack(v) => v.reports.is_empty(),
            Rtcp::Pli(_) => false,
            Rtcp::Fir(v) => v.reports.is_empty(),
            Rtcp::TransportFeedback(_) => false,
            Rtcp::Remb(_) => false,
        }
    }

    fn pack(feedback: &mut VecDeque<Self>, mut word_capacity: usize) {
        // Need at least one item to pack into, and one to take from.
        if feedback.len() < 2 {
            return;
        }

        // SR/RR first since they carry the SSRC for SRTCP.
        feedback.make_contiguous().sort_by_key(Self::order_no);

        let len = feedback.len();
        let mut i = 0;

        'outer: loop {
            if i == len - 1 {
                break;
            }

            let (pack_into, pack_from) = feedback.make_contiguous().split_at_mut(i + 1);
            let fb_a = pack_into.last_mut().unwrap();

            if word_capacity < fb_a.length_words() {
                break 'outer;
            }

            let mut any_change = false;

            for fb_b in pack_from {
                if fb_a.is_full() || fb_a.is_empty() {
                    break;
                }

                if word_capacity < fb_a.length_words() {
                    break 'outer;
                }

                let capacity = word_capacity - fb_a.length_words();

                any_change |= fb_a.merge(fb_b, capacity);
            }

            if !any_change {
                word_capacity -= fb_a.length_words();
                i += 1;
            }
        }

        feedback.retain(|f| !f.is_empty());
    }

    fn order_no(&self) -> u8 {
        use Rtcp::*;
        match self {
            SenderReport(_) => 0,
            ReceiverReport(_) => 1,
            SourceDescription(_) => 2,
            Nack(_) => 3,
            Pli(_) => 4,
            Fir(_) => 5,
            TransportFeedback(_) => 6,
            Remb(_) => 7,
            // Goodbye last since it removes sources.
            Goodbye(_) => 8,
        }
    }
}

impl RtcpPacket for Rtcp {
    fn header(&self) -> RtcpHeader {
        match self {
            Rtcp::SenderReport(v) => v.header(),
            Rtcp::ReceiverReport(v) => v.header(),
            Rtcp::SourceDescription(v) => v.header(),
            Rtcp::Goodbye(v) => v.header(),
            Rtcp::Nack(v) => v.header(),
            Rtcp::Pli(v) => v.header(),
            Rtcp::Fir(v) => v.header(),
            Rtcp::TransportFeedback(v) => v.header(),
            Rtcp::Remb(v) => v.header(),
        }
    }

    fn length_words(&self) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.length_words(),
            Rtcp::ReceiverReport(v) => v.length_words(),
            Rtcp::SourceDescription(v) => v.length_words(),
            Rtcp::Goodbye(v) => v.length_words(),
            Rtcp::Nack(v) => v.length_words(),
            Rtcp::Pli(v) => v.length_words(),
            Rtcp::Fir(v) => v.length_words(),
            Rtcp::TransportFeedback(v) => v.length_words(),
            Rtcp::Remb(v) => v.length_words(),
        }
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.write_to(buf),
            Rtcp::ReceiverReport(v) => v.write_to(buf),
            Rtcp::SourceDescription(v) => v.write_to(buf),
            Rtcp::Goodbye(v) => v.write_to(buf),
            Rtcp::Nack(v) => v.write_to(buf),
            Rtcp::Pli(v) => v.write_to(buf),
            Rtcp::Fir(v) => v.write_to(buf),
            Rtcp::TransportFeedback(v) => v.write_to(buf),
            Rtcp::Remb(v) => v.write_to(buf),
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Rtcp {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        let header: RtcpHeader = buf.try_into()?;

        // Sub-parsers consume until buffer exhaustion. Padding is removed
        // by the caller.
        let buf = &buf[4..];

        Ok(match header.rtcp_type() {
            RtcpType::SenderReport => Rtcp::SenderReport(buf.try_into()?),
            RtcpType::ReceiverReport => Rtcp::ReceiverReport(buf.try_into()?),
            RtcpType::SourceDescription => Rtcp::SourceDescription(buf.try_into()?),
            RtcpType::Goodbye => Rtcp::Goodbye((header.count(), buf).try_into()?),
            RtcpType::ApplicationDefined => return Err("Ignore RTCP type: ApplicationDefined"),
            RtcpType::ExtendedReport => return Err("Ignore RTCP type: ExtendedReport"),
            RtcpType::TransportLayerFeedback => {
                let FeedbackMessageType::TransportFeedback(fmt) = header.feedback_message_type()
                else {
                    return Err("Expected TransportFeedback fmt");
                };

                match fmt {
                    TransportType::Nack => Rtcp::Nack(buf.try_into()?),
                    TransportType::TransportWide => Rtcp::TransportFeedback(buf.try_into()?),
                }
            }
            RtcpType::PayloadSpecificFeedback => {
                let FeedbackMessageType::PayloadFeedback(fmt) = header.feedback_message_type()
                else {
                    return Err("Expected PayloadFeedback fmt");
                };

                match fmt {
                    PayloadType::PictureLossIndication => Rtcp::Pli(buf.try_into()?),
                    PayloadType::FullIntraRequest => Rtcp::Fir(buf.try_into()?),
                    PayloadType::ApplicationLayer => Rtcp::Remb(buf.try_into()?),
                    PayloadType::SliceLossIndication => return Err("Ignore PSFB fmt: SLI"),
                    PayloadType::ReferencePictureSelectionIndication => {
                        return Err("Ignore PSFB fmt: RPSI")
                    }
                }
            }
        })
    }
}

impl list::WordSized for Ssrc {
    fn word_size(&self) -> usize {
        1
    }
}

/// Pad up to the next word (4 byte) boundary.
fn pad_bytes_to_word(n: usize) -> usize {
    let pad = 4 - n % 4;
    if pad == 4 {
        n
    } else {
        n + pad
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn report(ssrc: u32) -> ReceptionReport {
        ReceptionReport {
            ssrc: ssrc.into(),
            fraction_lost: 3,
            packets_lost: 1234,
            max_seq: 4000,
            jitter: 5,
            last_sr_time: 12,
            last_sr_delay: 1,
        }
    }

    fn sr(ssrc: u32) -> Rtcp {
        Rtcp::SenderReport(SenderReport {
            sender_info: SenderInfo {
                ssrc: ssrc.into(),
                ntp_time: 0x0001_0002_0003_0004,
                rtp_time: 4_000,
                sender_packet_count: 5,
                sender_octet_count: 6,
            },
            reports: report(2).into(),
        })
    }

    fn rr(ssrc: u32) -> Rtcp {
        Rtcp::ReceiverReport(ReceiverReport {
            sender_ssrc: 42.into(),
            reports: report(ssrc).into(),
        })
    }

    #[test]
    fn pack_rr_into_sr() {
        let mut queue = VecDeque::new();
        queue.push_back(rr(3));
        queue.push_back(rr(4));
        queue.push_back(rr(5));
        queue.push_back(sr(1)); // sorted to front

        Rtcp::pack(&mut queue, 350);

        assert_eq!(queue.len(), 1);

        let Rtcp::SenderReport(sr) = queue.pop_front().unwrap() else {
            panic!("Expected SenderReport");
        };

        assert_eq!(sr.reports.len(), 4);
        let mut iter = sr.reports.iter();
        assert_eq!(iter.next().unwrap(), &report(2));
        assert_eq!(iter.next().unwrap(), &report(3));
        assert_eq!(iter.next().unwrap(), &report(4));
        assert_eq!(iter.next().unwrap(), &report(5));
    }

    #[test]
    fn pack_4_rr() {
        let mut queue = VecDeque::new();
        for i in 1..=4 {
            queue.push_back(rr(i));
        }

        Rtcp::pack(&mut queue, 350);

        assert_eq!(queue.len(), 1);

        let Rtcp::ReceiverReport(rr) = queue.pop_front().unwrap() else {
            panic!("Expected ReceiverReport");
        };

        assert_eq!(rr.reports.len(), 4);
    }

    #[test]
    fn compound_roundtrip_sr_rr_sdes() {
        let mut feedback = VecDeque::new();
        feedback.push_back(sr(1));
        feedback.push_back(rr(3));
        feedback.push_back(Rtcp::SourceDescription(Descriptions::cname(
            1.into(),
            "test-cname",
        )));

        let mut compare = feedback.clone();

        let mut buf = vec![0u8; 1360];
        let n = Rtcp::write_packet(&mut feedback, &mut buf);
        buf.truncate(n);

        let mut parsed = VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);

        Rtcp::pack(&mut compare, 340);
        assert_eq!(parsed, compare);
    }

    #[test]
    fn twcc_serialized_with_padding_bit() {
        let mut queue = VecDeque::new();
        let mut twcc = TransportFeedback::new();
        twcc.sender_ssrc = 1.into();
        twcc.base_seq = 82;
        twcc.status_count = 3;
        twcc.reference_time_ms = 25 * 64;
        twcc.feedback_count = 17;
        twcc.chunks
            .push_back(PacketChunk::RunLength(PacketStatus::SmallDelta, 3));
        twcc.deltas.push_back(0x7c);
        twcc.deltas.push_back(0x93);
        twcc.deltas.push_back(0x84);
        queue.push_back(Rtcp::TransportFeedback(twcc));

        let mut buf = vec![0u8; 1500];
        let n = Rtcp::write_packet(&mut queue, &mut buf);
        buf.truncate(n);

        assert_eq!(
            &buf,
            &[
                0xaf, 0xcd, 0x00, 0x06, // header with padding bit
                0x00, 0x00, 0x00, 0x01, // sender SSRC
                0x00, 0x00, 0x00, 0x00, // media SSRC
                0x00, 0x52, // base seq
                0x00, 0x03, // status count
                0x00, 0x00, 0x19, // reference time
                0x11, // feedback count
                0x20, 0x03, // run of 3
                0x7c, 0x93, 0x84, // three small deltas
                0x00, 0x00, 0x03 // padding
            ]
        );

        // And it parses back.
        let mut parsed = VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);
        assert_eq!(parsed.len(), 1);
        let Rtcp::TransportFeedback(fb) = parsed.pop_front().unwrap() else {
            panic!("Expected TransportFeedback");
        };
        assert_eq!(fb.base_seq, 82);
        assert_eq!(fb.status_count, 3);
        assert_eq!(fb.deltas, [0x7c, 0x93, 0x84]);
    }

    #[test]
    fn fuzz_failures_do_not_panic() {
        const TESTS: &[&[u8]] = &[
            &[133, 201, 0, 0],
            &[191, 202, 54, 74],
            &[166, 202, 0, 2, 218, 54, 214, 222, 160, 2, 146, 0, 251],
            &[
                143, 205, 0, 8, 143, 93, 208, 93, 201, 4, 131, 131, 131, 3, 0, 143, 1, 143, 0, 143,
                0, 80, 143, 231, 231, 0, 143, 181, 202, 0, 143, 236, 242, 0, 238, 21,
            ],
        ];

        let mut parsed = VecDeque::new();
        for t in TESTS {
            parsed.clear();
            Rtcp::read_packet(t, &mut parsed);
        }
    }
}
