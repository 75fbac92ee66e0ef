use super::list::WordSized;
use super::{extend_u16, SeqNo};
use super::{FeedbackMessageType, ReportList, RtcpHeader, RtcpPacket};
use super::{RtcpType, Ssrc, TransportType};

/// Generic NACK reporting missing packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The media source the missing packets belong to.
    pub ssrc: Ssrc,
    /// Missing ranges, 17 sequence numbers per entry.
    pub reports: ReportList<NackEntry>,
}

/// One NACK entry: a base pid plus a bitmask of 16 following packets.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl RtcpPacket for Nack {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            feedback_message_type: FeedbackMessageType::TransportFeedback(TransportType::Nack),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        1 + 2 + self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(&mut buf[..4]);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut buf = &mut buf[12..];
        for r in &self.reports {
            buf[0..2].copy_from_slice(&r.pid.to_be_bytes());
            buf[2..4].copy_from_slice(&r.blp.to_be_bytes());
            buf = &mut buf[4..];
        }

        self.length_words() * 4
    }
}

impl WordSized for NackEntry {
    fn word_size(&self) -> usize {
        1
    }
}

impl<'a> TryFrom<&'a [u8]> for Nack {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 12 {
            return Err("Nack less than 12 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();

        let mut reports = ReportList::new();
        let mut buf = &buf[8..];
        let count = (buf.len() / 4).min(31);

        for _ in 0..count {
            let pid = u16::from_be_bytes([buf[0], buf[1]]);
            let blp = u16::from_be_bytes([buf[2], buf[3]]);
            reports.push(NackEntry { pid, blp });
            buf = &buf[4..];
        }

        Ok(Nack {
            sender_ssrc,
            ssrc,
            reports,
        })
    }
}

impl NackEntry {
    /// Iterator over the missing sequence numbers, widened against a
    /// reference sequence for rollover handling.
    pub fn into_iter(self, extend_from: SeqNo) -> impl Iterator<Item = SeqNo> {
        NackEntryIterator {
            entry: self,
            index: 0,
            extend_from,
        }
    }
}

struct NackEntryIterator {
    entry: NackEntry,
    index: u16,
    extend_from: SeqNo,
}

impl Iterator for NackEntryIterator {
    type Item = SeqNo;

    fn next(&mut self) -> Option<Self::Item> {
        let seq_16 = if self.index == 0 {
            self.index += 1;
            self.entry.pid
        } else {
            loop {
                if self.index >= 17 {
                    return None;
                }
                let bit = self.index - 1;
                self.index += 1;
                if self.entry.blp & (1 << bit) > 0 {
                    break self.entry.pid.wrapping_add(bit + 1);
                }
            }
        };

        Some(extend_u16(Some(*self.extend_from), seq_16).into())
    }
}
