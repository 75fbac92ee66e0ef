#![allow(clippy::unusual_byte_groupings)]

use super::ext::{ExtensionMap, ExtensionValues, ExtensionsForm};
use super::{Pt, SeqNo, Ssrc};

/// Parsed header of an RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2.
    pub version: u8,
    /// Whether the packet is padded to an even multiple of 4 bytes.
    pub has_padding: bool,
    /// Whether the packet carries RFC 8285 header extensions.
    pub has_extension: bool,
    /// For video the marker ends a frame, for audio it starts a talkspurt.
    pub marker: bool,
    /// Payload type.
    pub payload_type: Pt,
    /// Wire sequence number, increases by 1 per packet.
    pub sequence_number: u16,
    /// Media time of the packet in the codec clock rate.
    pub timestamp: u32,
    /// Originating source.
    pub ssrc: Ssrc,
    /// Extension values parsed using the id mapping in effect.
    pub ext_vals: ExtensionValues,
    /// Total header length, including CSRCs and extensions.
    pub header_len: usize,
}

impl RtpHeader {
    /// Parse a header, interpreting extensions with `exts`.
    pub fn parse(buf: &[u8], exts: &ExtensionMap) -> Option<RtpHeader> {
        let orig_len = buf.len();

        if buf.len() < 12 {
            trace!("RTP header too short: {}", buf.len());
            return None;
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            trace!("RTP version is not 2");
            return None;
        }

        let has_padding = buf[0] & 0b0010_0000 > 0;
        let has_extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;
        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = (buf[1] & 0b0111_1111).into();
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]).into();

        let buf = &buf[12..];

        let csrc_len = 4 * csrc_count;
        if buf.len() < csrc_len {
            trace!("RTP header truncated in CSRC list");
            return None;
        }
        let buf = &buf[csrc_len..];

        let mut ext_vals = ExtensionValues::default();

        let rest = if !has_extension {
            buf
        } else {
            if buf.len() < 4 {
                trace!("RTP header extension block too short");
                return None;
            }

            let Some(form) = ExtensionsForm::parse([buf[0], buf[1]]) else {
                trace!(
                    "Unknown RTP header extension form: {:#06x}",
                    u16::from_be_bytes([buf[0], buf[1]])
                );
                return None;
            };

            let ext_words = u16::from_be_bytes([buf[2], buf[3]]);
            let ext_len = ext_words as usize * 4;

            let buf = &buf[4..];

            if buf.len() < ext_len {
                trace!("RTP ext len exceeds buffer: {} > {}", ext_len, buf.len());
                return None;
            }

            exts.parse(&buf[..ext_len], form, &mut ext_vals);

            &buf[ext_len..]
        };

        let header_len = orig_len - rest.len();

        Some(RtpHeader {
            version,
            has_padding,
            has_extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ext_vals,
            header_len,
        })
    }

    /// Serialize this header into `buf` using the one-byte extension form.
    ///
    /// Returns the number of bytes written. The extension block is padded
    /// to a word boundary. CSRCs are not written; the SFU never forwards
    /// contributing sources.
    pub fn write_to(&self, buf: &mut [u8], exts: &ExtensionMap) -> usize {
        buf[0] = 0b10_0_0_0000 | if self.has_padding { 1 << 5 } else { 0 } | 1 << 4;

        assert!(*self.payload_type <= 127);
        buf[1] = *self.payload_type & 0b0111_1111 | if self.marker { 1 << 7 } else { 0 };

        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf[12..14].copy_from_slice(&ExtensionsForm::OneByte.serialize());

        let ext_buf = &mut buf[16..];
        let mut ext_len = exts.write_to(ext_buf, &self.ext_vals);

        let pad = 4 - ext_len % 4;
        if pad < 4 {
            for i in 0..pad {
                ext_buf[ext_len + i] = 0;
            }
            ext_len += pad;
        }

        let words = (ext_len / 4) as u16;
        buf[14..16].copy_from_slice(&words.to_be_bytes());

        16 + ext_len
    }

    /// The payload length given a total packet length.
    ///
    /// Takes the padding suffix into account.
    pub(crate) fn payload_range(&self, data: &[u8]) -> std::ops::Range<usize> {
        let mut end = data.len();
        if self.has_padding && end > self.header_len {
            let pad = data[end - 1] as usize;
            if pad <= end - self.header_len {
                end -= pad;
            }
        }
        self.header_len..end.max(self.header_len)
    }

    /// Extend a wire sequence number into 64 bits given the previously
    /// extended value.
    pub fn sequence_number(&self, previous: Option<SeqNo>) -> SeqNo {
        extend_u16(previous.map(|v| *v), self.sequence_number).into()
    }
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: 2,
            has_padding: false,
            has_extension: true,
            marker: false,
            payload_type: 1.into(),
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0.into(),
            ext_vals: ExtensionValues::default(),
            header_len: 16,
        }
    }
}

/// Widen a 16 bit sequence number to 64 bits using the previous widened
/// value to detect wrap-arounds.
pub fn extend_u16(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    const MAX: u64 = u16::MAX as u64 + 1;
    const HALF: u64 = MAX / 2;

    let seq = seq as u64;

    let Some(prev_index) = prev_ext_seq else {
        return seq;
    };

    let roc = (prev_index >> 16) as i64;
    let prev_seq = prev_index & (MAX - 1);

    let v = if prev_seq < HALF {
        if seq > HALF + prev_seq {
            roc - 1
        } else {
            roc
        }
    } else if prev_seq > seq + HALF {
        roc + 1
    } else {
        roc
    };

    if v < 0 {
        return 0;
    }

    (v as u64) * MAX + seq
}

#[cfg(test)]
mod test {
    use super::super::ext::Extension;
    use super::*;

    #[test]
    fn extend_u16_wrap_around() {
        assert_eq!(extend_u16(None, 0), 0);
        assert_eq!(extend_u16(Some(0), 1), 1);
        assert_eq!(extend_u16(Some(65_535), 0), 65_536);
        assert_eq!(extend_u16(Some(65_500), 2), 65_538);
        assert_eq!(extend_u16(Some(2), 1), 1);
        assert_eq!(extend_u16(Some(65_538), 1), 65_537);
        assert_eq!(extend_u16(Some(65_500), 65_500), 65_500);
    }

    #[test]
    fn parse_minimal() {
        #[rustfmt::skip]
        let buf = [
            0x80, 96, 0x12, 0x34,       // v=2, pt=96, seq 0x1234
            0, 0, 0x27, 0x10,           // ts 10000
            0, 0, 0, 42,                // ssrc 42
            1, 2, 3, 4,                 // payload
        ];

        let h = RtpHeader::parse(&buf, &ExtensionMap::empty()).unwrap();

        assert_eq!(h.version, 2);
        assert!(!h.has_extension);
        assert_eq!(*h.payload_type, 96);
        assert_eq!(h.sequence_number, 0x1234);
        assert_eq!(h.timestamp, 10_000);
        assert_eq!(*h.ssrc, 42);
        assert_eq!(h.header_len, 12);
    }

    #[test]
    fn write_then_parse() {
        let mut exts = ExtensionMap::empty();
        exts.set(3, Extension::TransportSequenceNumber);
        exts.set(4, Extension::RtpMid);

        let header = RtpHeader {
            payload_type: 111.into(),
            sequence_number: 47_000,
            timestamp: 10_000,
            ssrc: 44.into(),
            marker: true,
            ext_vals: ExtensionValues {
                transport_cc: Some(991),
                mid: Some("xy".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut buf = vec![0; 128];
        let n = header.write_to(&mut buf, &exts);
        buf.truncate(n);

        let parsed = RtpHeader::parse(&buf, &exts).unwrap();
        assert_eq!(parsed.sequence_number, 47_000);
        assert_eq!(parsed.timestamp, 10_000);
        assert!(parsed.marker);
        assert_eq!(parsed.ext_vals.transport_cc, Some(991));
        assert_eq!(parsed.ext_vals.mid, Some("xy".into()));
        assert_eq!(parsed.header_len, n);
    }

    #[test]
    fn truncated_extension_fails() {
        #[rustfmt::skip]
        let buf = [
            0x90, 96, 0, 1,             // v=2, x=1
            0, 0, 0, 1,
            0, 0, 0, 42,
            0xbe, 0xde, 0, 4,           // claims 4 words of extension
            0, 0,                       // but only 2 bytes follow
        ];

        assert!(RtpHeader::parse(&buf, &ExtensionMap::empty()).is_none());
    }

    #[test]
    fn payload_range_with_padding() {
        #[rustfmt::skip]
        let buf = [
            0xa0, 96, 0, 1,             // v=2, p=1
            0, 0, 0, 1,
            0, 0, 0, 42,
            1, 2, 3,                    // payload
            0, 0, 0, 0, 5,              // 5 bytes padding
        ];

        let h = RtpHeader::parse(&buf, &ExtensionMap::empty()).unwrap();
        let range = h.payload_range(&buf);
        assert_eq!(&buf[range], &[1, 2, 3]);
    }
}
