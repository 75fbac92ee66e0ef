use std::fmt;

use super::{Mid, Rid};

/// RTP header extensions the SFU understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// <urn:ietf:params:rtp-hdrext:sdes:mid>
    RtpMid,
    /// <urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id>
    RtpStreamId,
    /// <urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id>
    RepairedRtpStreamId,
    /// <http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time>
    AbsoluteSendTime,
    /// <http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01>
    TransportSequenceNumber,
    /// <http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07>
    FrameMarking,
    /// <urn:ietf:params:rtp-hdrext:ssrc-audio-level>
    AudioLevel,
    /// <urn:3gpp:video-orientation>
    VideoOrientation,
    /// <urn:ietf:params:rtp-hdrext:toffset>
    TransmissionTimeOffset,
}

/// Largest extension id expressible in the one-byte form.
pub const MAX_ID: u8 = 14;

// All extensions in a block share one form. RFC 8285 section 4.2/4.3.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ExtensionsForm {
    // ID range 1..=14, length range 1..=16.
    OneByte = 0xBEDE,
    // ID range 1..=255, length range 0..=255.
    TwoByte = 0x1000,
}

impl ExtensionsForm {
    pub(crate) fn serialize(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }

    pub(crate) fn parse(bytes: [u8; 2]) -> Option<Self> {
        let v = u16::from_be_bytes(bytes);
        if v == ExtensionsForm::OneByte as u16 {
            Some(ExtensionsForm::OneByte)
        } else if (v & 0xfff0) == ExtensionsForm::TwoByte as u16 {
            // The low 4 bits are "app bits" and ignored.
            Some(ExtensionsForm::TwoByte)
        } else {
            None
        }
    }
}

/// Mapping of extension id (1..=14) to extension type.
///
/// Each producer declares its own ids; the transport keeps the union of all
/// producer declarations so egress packets can be written with one
/// consistent set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionMap([Option<Extension>; MAX_ID as usize]);

impl ExtensionMap {
    /// An empty mapping.
    pub fn empty() -> Self {
        ExtensionMap::default()
    }

    /// The id layout Chrome offers by default. Useful for tests.
    pub fn standard() -> Self {
        let mut map = Self::empty();
        map.set(1, Extension::AudioLevel);
        map.set(2, Extension::AbsoluteSendTime);
        map.set(3, Extension::TransportSequenceNumber);
        map.set(4, Extension::RtpMid);
        map.set(10, Extension::RtpStreamId);
        map.set(11, Extension::RepairedRtpStreamId);
        map.set(13, Extension::VideoOrientation);
        map.set(14, Extension::TransmissionTimeOffset);
        map
    }

    /// Set a mapping. The id must be 1..=14; out of range ids are ignored.
    pub fn set(&mut self, id: u8, ext: Extension) {
        if id < 1 || id > MAX_ID {
            debug!("RTP extension id out of range 1-{}: {}", MAX_ID, id);
            return;
        }
        self.0[id as usize - 1] = Some(ext);
    }

    /// The extension mapped for an id.
    pub fn lookup(&self, id: u8) -> Option<Extension> {
        if id < 1 || id > MAX_ID {
            return None;
        }
        self.0[id as usize - 1]
    }

    /// The id an extension is mapped at, if any.
    pub fn id_of(&self, ext: Extension) -> Option<u8> {
        self.0
            .iter()
            .position(|e| *e == Some(ext))
            .map(|i| i as u8 + 1)
    }

    /// Take over all mappings set in `other`.
    ///
    /// Used by the transport to keep the union of the ids declared by its
    /// attached producers.
    pub fn merge(&mut self, other: &ExtensionMap) {
        for (i, ext) in other.0.iter().enumerate() {
            let Some(ext) = ext else {
                continue;
            };
            let id = i as u8 + 1;
            if let Some(prev) = self.0[i] {
                if prev != *ext {
                    warn!("RTP extension id {} remapped {:?} -> {:?}", id, prev, ext);
                }
            }
            self.0[i] = Some(*ext);
        }
    }

    /// Iterator over (id, extension) pairs that are set.
    pub fn iter(&self) -> impl Iterator<Item = (u8, Extension)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|e| (i as u8 + 1, e)))
    }

    pub(crate) fn parse(&self, buf: &[u8], form: ExtensionsForm, values: &mut ExtensionValues) {
        match form {
            ExtensionsForm::OneByte => self.parse_one_byte(buf, values),
            ExtensionsForm::TwoByte => self.parse_two_byte(buf, values),
        }
    }

    fn parse_one_byte(&self, mut buf: &[u8], values: &mut ExtensionValues) {
        loop {
            if buf.is_empty() {
                break;
            }

            // Padding between elements.
            if buf[0] == 0 {
                buf = &buf[1..];
                continue;
            }

            let id = buf[0] >> 4;
            let len = (buf[0] & 0xf) as usize + 1;
            buf = &buf[1..];

            // Id 15 is reserved and terminates the block.
            if id == 15 {
                break;
            }

            if buf.len() < len {
                trace!("Not enough type ext len: {} < {}", buf.len(), len);
                break;
            }

            if let Some(ext) = self.lookup(id) {
                ext.parse_value(&buf[..len], values);
            }

            buf = &buf[len..];
        }
    }

    fn parse_two_byte(&self, mut buf: &[u8], values: &mut ExtensionValues) {
        loop {
            if buf.is_empty() {
                break;
            }

            // Padding between elements.
            if buf[0] == 0 {
                buf = &buf[1..];
                continue;
            }

            if buf.len() < 2 {
                break;
            }

            let id = buf[0];
            let len = buf[1] as usize;
            buf = &buf[2..];

            if buf.len() < len {
                trace!("Not enough type ext len: {} < {}", buf.len(), len);
                break;
            }

            if let Some(ext) = self.lookup(id) {
                ext.parse_value(&buf[..len], values);
            }

            buf = &buf[len..];
        }
    }

    /// Write the values present in `values` using the one-byte form.
    ///
    /// Returns the number of bytes written, not including block padding.
    pub(crate) fn write_to(&self, buf: &mut [u8], values: &ExtensionValues) -> usize {
        let mut offset = 0;

        for (id, ext) in self.iter() {
            let remaining = &mut buf[offset..];
            if remaining.len() < 17 {
                break;
            }

            let n = ext.write_value(&mut remaining[1..], values);
            if n == 0 {
                continue;
            }
            assert!(n <= 16);
            remaining[0] = (id << 4) | (n as u8 - 1);

            offset += 1 + n;
        }

        offset
    }
}

impl Extension {
    pub(crate) fn parse_value(&self, buf: &[u8], v: &mut ExtensionValues) {
        use Extension::*;
        match self {
            RtpMid => {
                if let Ok(s) = std::str::from_utf8(buf) {
                    v.mid = Some(s.into());
                }
            }
            RtpStreamId => {
                if let Ok(s) = std::str::from_utf8(buf) {
                    v.rid = Some(s.into());
                }
            }
            RepairedRtpStreamId => {
                if let Ok(s) = std::str::from_utf8(buf) {
                    v.rid_repair = Some(s.into());
                }
            }
            AbsoluteSendTime => {
                if buf.len() >= 3 {
                    // 24 bit fixed point, 6.18 seconds.
                    v.abs_send_time = Some(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]));
                }
            }
            TransportSequenceNumber => {
                if buf.len() >= 2 {
                    v.transport_cc = Some(u16::from_be_bytes([buf[0], buf[1]]));
                }
            }
            FrameMarking => {
                if !buf.is_empty() {
                    v.frame_marking = Some(buf[0]);
                }
            }
            AudioLevel => {
                if !buf.is_empty() {
                    v.voice_activity = Some(buf[0] & 0x80 > 0);
                    v.audio_level = Some(-((buf[0] & 0x7f) as i8));
                }
            }
            VideoOrientation => {
                if !buf.is_empty() {
                    v.video_orientation = Some(buf[0] & 0x3);
                }
            }
            TransmissionTimeOffset => {
                if buf.len() >= 3 {
                    v.transmission_offset = Some(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]));
                }
            }
        }
    }

    pub(crate) fn write_value(&self, buf: &mut [u8], v: &ExtensionValues) -> usize {
        use Extension::*;
        match self {
            RtpMid => {
                if let Some(mid) = &v.mid {
                    let s = mid.as_bytes_trimmed();
                    buf[..s.len()].copy_from_slice(s);
                    return s.len();
                }
            }
            RtpStreamId => {
                if let Some(rid) = &v.rid {
                    let s = rid.as_bytes_trimmed();
                    buf[..s.len()].copy_from_slice(s);
                    return s.len();
                }
            }
            RepairedRtpStreamId => {
                if let Some(rid) = &v.rid_repair {
                    let s = rid.as_bytes_trimmed();
                    buf[..s.len()].copy_from_slice(s);
                    return s.len();
                }
            }
            AbsoluteSendTime => {
                if let Some(t) = v.abs_send_time {
                    let b = t.to_be_bytes();
                    buf[..3].copy_from_slice(&b[1..]);
                    return 3;
                }
            }
            TransportSequenceNumber => {
                if let Some(seq) = v.transport_cc {
                    buf[..2].copy_from_slice(&seq.to_be_bytes());
                    return 2;
                }
            }
            FrameMarking => {
                if let Some(m) = v.frame_marking {
                    buf[0] = m;
                    return 1;
                }
            }
            AudioLevel => {
                if let (Some(level), Some(vad)) = (v.audio_level, v.voice_activity) {
                    buf[0] = (-level).clamp(0, 127) as u8 | if vad { 0x80 } else { 0 };
                    return 1;
                }
            }
            VideoOrientation => {
                if let Some(o) = v.video_orientation {
                    buf[0] = o & 0x3;
                    return 1;
                }
            }
            TransmissionTimeOffset => {
                if let Some(t) = v.transmission_offset {
                    let b = t.to_be_bytes();
                    buf[..3].copy_from_slice(&b[1..]);
                    return 3;
                }
            }
        }
        0
    }
}

impl Mid {
    fn as_bytes_trimmed(&self) -> &[u8] {
        let s: &str = self;
        s.as_bytes()
    }
}

impl Rid {
    fn as_bytes_trimmed(&self) -> &[u8] {
        let s: &str = self;
        s.as_bytes()
    }
}

/// Extension values parsed from (or to be written into) one RTP packet.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionValues {
    /// Media identifier, binding the packet to a producer.
    pub mid: Option<Mid>,
    /// Stream identifier, binding the packet to one encoding.
    pub rid: Option<Rid>,
    /// Stream identifier of the stream this RTX stream repairs.
    pub rid_repair: Option<Rid>,
    /// Sender clock at send time, 24 bit fixed point 6.18 seconds.
    pub abs_send_time: Option<u32>,
    /// Transport-wide sequence number.
    pub transport_cc: Option<u16>,
    /// Frame marking flags (first byte of the extension).
    pub frame_marking: Option<u8>,
    /// Audio level in negative decibel. 0 is max.
    pub audio_level: Option<i8>,
    /// Whether the audio source speaks.
    pub voice_activity: Option<bool>,
    /// Camera rotation, 2 bits.
    pub video_orientation: Option<u8>,
    /// Transmission queue offset in RTP time units.
    pub transmission_offset: Option<u32>,
}

impl fmt::Debug for ExtensionValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionValues {{")?;
        if let Some(t) = self.mid {
            write!(f, " mid: {}", t)?;
        }
        if let Some(t) = self.rid {
            write!(f, " rid: {}", t)?;
        }
        if let Some(t) = self.rid_repair {
            write!(f, " rid_repair: {}", t)?;
        }
        if let Some(t) = self.abs_send_time {
            write!(f, " abs_send_time: {}", t)?;
        }
        if let Some(t) = self.transport_cc {
            write!(f, " transport_cc: {}", t)?;
        }
        if let Some(t) = self.frame_marking {
            write!(f, " frame_marking: {:#02x}", t)?;
        }
        if let Some(t) = self.audio_level {
            write!(f, " audio_level: {}", t)?;
        }
        if let Some(t) = self.voice_activity {
            write!(f, " voice_activity: {}", t)?;
        }
        if let Some(t) = self.video_orientation {
            write!(f, " video_orientation: {}", t)?;
        }
        if let Some(t) = self.transmission_offset {
            write!(f, " transmission_offset: {}", t)?;
        }
        write!(f, " }}")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn form_parse() {
        assert_eq!(
            ExtensionsForm::parse([0xbe, 0xde]),
            Some(ExtensionsForm::OneByte)
        );
        assert_eq!(
            ExtensionsForm::parse([0x10, 0x07]),
            Some(ExtensionsForm::TwoByte)
        );
        assert_eq!(ExtensionsForm::parse([0x12, 0x34]), None);
    }

    #[test]
    fn map_merge_is_union() {
        let mut a = ExtensionMap::empty();
        a.set(4, Extension::RtpMid);

        let mut b = ExtensionMap::empty();
        b.set(3, Extension::TransportSequenceNumber);
        b.set(4, Extension::RtpMid);

        a.merge(&b);

        assert_eq!(a.id_of(Extension::RtpMid), Some(4));
        assert_eq!(a.id_of(Extension::TransportSequenceNumber), Some(3));
    }

    #[test]
    fn write_then_parse_one_byte() {
        let map = ExtensionMap::standard();

        let values = ExtensionValues {
            audio_level: Some(-42),
            voice_activity: Some(true),
            transport_cc: Some(1234),
            mid: Some("a".into()),
            ..Default::default()
        };

        let mut buf = [0u8; 64];
        let n = map.write_to(&mut buf, &values);
        assert!(n > 0);

        let mut parsed = ExtensionValues::default();
        map.parse(&buf[..n], ExtensionsForm::OneByte, &mut parsed);

        assert_eq!(parsed.audio_level, Some(-42));
        assert_eq!(parsed.voice_activity, Some(true));
        assert_eq!(parsed.transport_cc, Some(1234));
        assert_eq!(parsed.mid, Some("a".into()));
    }

    #[test]
    fn two_byte_parse() {
        let mut map = ExtensionMap::empty();
        map.set(3, Extension::TransportSequenceNumber);

        // id 3, len 2, value 0x0102.
        let buf = [3, 2, 1, 2];
        let mut parsed = ExtensionValues::default();
        map.parse(&buf, ExtensionsForm::TwoByte, &mut parsed);

        assert_eq!(parsed.transport_cc, Some(0x0102));
    }
}
