use super::{FeedbackMessageType, PayloadType, RtcpHeader, RtcpPacket};
use super::{RtcpType, Ssrc};

const BITRATE_MAX: f32 = 2.417_842_4e24; // 0x3FFFF * 2^63
const MANTISSA_MAX: u32 = 0x7f_ffff;
const UNIQUE_IDENTIFIER: [u8; 4] = [b'R', b'E', b'M', b'B'];

/// Receiver estimated maximum bitrate, carried as PSFB AFB.
///
/// The media SSRC of the feedback header is always 0; the SSRCs the
/// estimate applies to are listed in the packet body.
#[derive(Debug, Clone)]
pub struct Remb {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// Estimated maximum bitrate in bits per second.
    pub bitrate: f32,
    /// The sources the estimate applies to.
    pub ssrcs: Vec<u32>,
}

impl Remb {
    /// The bitrate as integer bits per second.
    pub fn bitrate_bps(&self) -> u64 {
        self.bitrate as u64
    }
}

impl Eq for Remb {}
impl PartialEq for Remb {
    fn eq(&self, other: &Self) -> bool {
        self.sender_ssrc == other.sender_ssrc
            && (self.bitrate as u64) == (other.bitrate as u64)
            && self.ssrcs == other.ssrcs
    }
}

impl RtcpPacket for Remb {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            feedback_message_type: FeedbackMessageType::PayloadFeedback(
                PayloadType::ApplicationLayer,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header, sender ssrc, media ssrc (0), "REMB", count+exp+mantissa, ssrcs
        1 + 2 + 2 + self.ssrcs.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        // Bitrate goes on the wire as 6 bit exponent + 18 bit mantissa.
        let mut exp = 0u8;
        let mut bitrate = self.bitrate.clamp(0.0, BITRATE_MAX);
        while bitrate >= (1 << 18) as f32 {
            bitrate /= 2.0;
            exp += 1;
        }
        let mantissa = bitrate.floor() as u32;

        self.header().write_to(&mut buf[..4]);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&[0; 4]);
        buf[12..16].copy_from_slice(&UNIQUE_IDENTIFIER);
        buf[16] = self.ssrcs.len() as u8;
        buf[17] = (exp << 2) | (mantissa >> 16) as u8;
        buf[18] = (mantissa >> 8) as u8;
        buf[19] = mantissa as u8;

        for (i, ssrc) in self.ssrcs.iter().enumerate() {
            buf[20 + i * 4..24 + i * 4].copy_from_slice(&ssrc.to_be_bytes());
        }

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Remb {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("Remb less than 16 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        let media_ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if media_ssrc != 0 {
            return Err("Remb media ssrc must be zero");
        }

        if buf[8..12] != UNIQUE_IDENTIFIER {
            return Err("Missing REMB identifier");
        }

        let ssrcs_len = buf[12] as usize;

        // Reconstruct an f32 from the 6 bit exponent / 18 bit mantissa.
        let mut exp = (buf[13] as u64) >> 2;
        exp += 127; // IEEE 754 bias
        exp += 23; // shift the decimal from the right to the left

        let mut mantissa = ((buf[13] & 3) as u32) << 16 | (buf[14] as u32) << 8 | buf[15] as u32;

        if mantissa != 0 {
            // IEEE 754 has an implicit leading bit.
            while (mantissa & (MANTISSA_MAX + 1)) == 0 {
                exp -= 1;
                mantissa *= 2;
            }
        }

        let bitrate = f32::from_bits(((exp as u32) << 23) | (mantissa & MANTISSA_MAX));

        if buf.len() < 16 + ssrcs_len * 4 {
            return Err("Remb too short for SSRC list");
        }

        let mut ssrcs = vec![];
        for i in 0..ssrcs_len {
            let at = 16 + i * 4;
            ssrcs.push(u32::from_be_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
            ]));
        }

        Ok(Remb {
            sender_ssrc,
            ssrcs,
            bitrate,
        })
    }
}
