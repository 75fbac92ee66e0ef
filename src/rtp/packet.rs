use super::ext::{ExtensionMap, ExtensionValues, ExtensionsForm};
use super::{Pt, RtpError, RtpHeader, Ssrc};

/// An RTP packet with its parsed header and owned wire data.
///
/// Mutators for SSRC, PT, sequence number, timestamp and marker patch the
/// wire bytes in place. Changing the set of header extensions (or their
/// ids) re-serializes the header and shifts the payload, which stays byte
/// identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub(crate) header: RtpHeader,
    data: Vec<u8>,
}

impl RtpPacket {
    /// Parse a packet, interpreting header extensions with `exts`.
    pub fn parse(data: &[u8], exts: &ExtensionMap) -> Result<RtpPacket, RtpError> {
        let header = RtpHeader::parse(data, exts).ok_or(RtpError::ParseHeader)?;

        Ok(RtpPacket {
            header,
            data: data.to_vec(),
        })
    }

    /// Construct from an already parsed header and data buffer.
    pub(crate) fn new(header: RtpHeader, data: Vec<u8>) -> RtpPacket {
        RtpPacket { header, data }
    }

    /// The parsed header.
    pub fn header(&self) -> &RtpHeader {
        &self.header
    }

    /// The full wire data, headers included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the packet, returning the wire data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Total packet size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet holds no data at all. Never true for parsed packets.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload, excluding header and padding.
    pub fn payload(&self) -> &[u8] {
        let range = self.header.payload_range(&self.data);
        &self.data[range]
    }

    pub fn ssrc(&self) -> Ssrc {
        self.header.ssrc
    }

    pub fn payload_type(&self) -> Pt {
        self.header.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn marker(&self) -> bool {
        self.header.marker
    }

    pub fn set_ssrc(&mut self, ssrc: Ssrc) {
        self.header.ssrc = ssrc;
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn set_payload_type(&mut self, pt: Pt) {
        assert!(*pt <= 127);
        self.header.payload_type = pt;
        self.data[1] = (self.data[1] & 0b1000_0000) | *pt;
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.header.sequence_number = seq;
        self.data[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        self.header.timestamp = ts;
        self.data[4..8].copy_from_slice(&ts.to_be_bytes());
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.header.marker = marker;
        if marker {
            self.data[1] |= 0b1000_0000;
        } else {
            self.data[1] &= 0b0111_1111;
        }
    }

    /// Write the transport-wide sequence number extension.
    ///
    /// Rewrites in place when the packet already carries the extension at
    /// the id `exts` maps; otherwise the header is re-serialized with the
    /// extension added.
    pub fn set_transport_wide_seq(&mut self, seq: u16, exts: &ExtensionMap) {
        self.header.ext_vals.transport_cc = Some(seq);

        let Some(id) = exts.id_of(super::Extension::TransportSequenceNumber) else {
            return;
        };

        if self.patch_ext(id, &seq.to_be_bytes()) {
            return;
        }

        self.rewrite_extensions(self.header.ext_vals, exts);
    }

    /// Replace the header extension block: the values in `values` are
    /// written with the ids of `to`. Payload bytes are untouched.
    pub fn rewrite_extensions(&mut self, values: ExtensionValues, to: &ExtensionMap) {
        let mut header = self.header.clone();
        header.ext_vals = values;

        let tail = &self.data[self.header.header_len..];

        let mut out = vec![0; 16 + 4 * 64 + tail.len()];
        let header_len = header.write_to(&mut out, to);
        out.truncate(header_len + tail.len());
        out[header_len..].copy_from_slice(tail);

        header.header_len = header_len;
        header.has_extension = true;

        self.header = header;
        self.data = out;
    }

    // Overwrite the value of extension element `id` when present with the
    // exact same length. Returns false when not patchable in place.
    fn patch_ext(&mut self, id: u8, value: &[u8]) -> bool {
        let Some((form, mut offset, end)) = self.ext_block() else {
            return false;
        };

        while offset < end {
            let (elem_id, len, value_at) = match form {
                ExtensionsForm::OneByte => {
                    let b = self.data[offset];
                    if b == 0 {
                        offset += 1;
                        continue;
                    }
                    let elem_id = b >> 4;
                    if elem_id == 15 {
                        break;
                    }
                    (elem_id, (b & 0xf) as usize + 1, offset + 1)
                }
                ExtensionsForm::TwoByte => {
                    if self.data[offset] == 0 {
                        offset += 1;
                        continue;
                    }
                    if offset + 1 >= end {
                        break;
                    }
                    (
                        self.data[offset],
                        self.data[offset + 1] as usize,
                        offset + 2,
                    )
                }
            };

            if value_at + len > end {
                break;
            }

            if elem_id == id {
                if len != value.len() {
                    return false;
                }
                self.data[value_at..value_at + len].copy_from_slice(value);
                return true;
            }

            offset = value_at + len;
        }

        false
    }

    // (form, start of extension elements, end) within `data`.
    fn ext_block(&self) -> Option<(ExtensionsForm, usize, usize)> {
        if !self.header.has_extension {
            return None;
        }

        let csrc_count = (self.data[0] & 0xf) as usize;
        let at = 12 + csrc_count * 4;

        if self.data.len() < at + 4 {
            return None;
        }

        let form = ExtensionsForm::parse([self.data[at], self.data[at + 1]])?;
        let words = u16::from_be_bytes([self.data[at + 2], self.data[at + 3]]) as usize;

        let start = at + 4;
        let end = (start + words * 4).min(self.data.len());

        Some((form, start, end))
    }
}
