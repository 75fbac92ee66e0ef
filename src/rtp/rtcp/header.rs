#![allow(clippy::unusual_byte_groupings)]

/// Types of RTCP packets by the PT field of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpType {
    /// SR
    SenderReport = 200,
    /// RR
    ReceiverReport = 201,
    /// SDES
    SourceDescription = 202,
    /// BYE
    Goodbye = 203,
    /// APP
    ApplicationDefined = 204,
    /// RTPFB
    TransportLayerFeedback = 205,
    /// PSFB
    PayloadSpecificFeedback = 206,
    /// XR
    ExtendedReport = 207,
}

impl TryFrom<u8> for RtcpType {
    type Error = &'static str;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use RtcpType::*;
        match v {
            200 => Ok(SenderReport),
            201 => Ok(ReceiverReport),
            202 => Ok(SourceDescription),
            203 => Ok(Goodbye),
            204 => Ok(ApplicationDefined),
            205 => Ok(TransportLayerFeedback),
            206 => Ok(PayloadSpecificFeedback),
            207 => Ok(ExtendedReport),
            _ => Err("Unknown RTCP type"),
        }
    }
}

/// Interpretation of the 5-bit count/fmt field of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMessageType {
    /// Number of reception reports (SR, RR).
    ReceptionReport(u8),
    /// Number of sources (SDES, BYE).
    SourceCount(u8),
    /// RTPFB message type.
    TransportFeedback(TransportType),
    /// PSFB message type.
    PayloadFeedback(PayloadType),
    /// Field unused by the packet type.
    NotUsed,
}

impl FeedbackMessageType {
    pub(crate) fn count(&self) -> u8 {
        match self {
            FeedbackMessageType::ReceptionReport(v) => *v,
            FeedbackMessageType::SourceCount(v) => *v,
            FeedbackMessageType::TransportFeedback(v) => *v as u8,
            FeedbackMessageType::PayloadFeedback(v) => *v as u8,
            FeedbackMessageType::NotUsed => 0,
        }
    }
}

/// RTPFB feedback formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Generic NACK.
    Nack = 1,
    /// Transport-wide congestion control feedback.
    TransportWide = 15,
}

/// PSFB feedback formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// PLI
    PictureLossIndication = 1,
    /// SLI
    SliceLossIndication = 2,
    /// RPSI
    ReferencePictureSelectionIndication = 3,
    /// FIR
    FullIntraRequest = 4,
    /// AFB. REMB is carried in this format.
    ApplicationLayer = 15,
}

/// The 4 byte common header starting every RTCP sub-packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub rtcp_type: RtcpType,
    pub feedback_message_type: FeedbackMessageType,
    /// Packet length in 32-bit words, minus one.
    pub words_less_one: u16,
}

impl RtcpHeader {
    /// Type of the packet this header starts.
    pub fn rtcp_type(&self) -> RtcpType {
        self.rtcp_type
    }

    /// The count/fmt field interpretation.
    pub fn feedback_message_type(&self) -> FeedbackMessageType {
        self.feedback_message_type
    }

    /// Number of reports/sources in the packet, from the count field.
    pub fn count(&self) -> usize {
        self.feedback_message_type.count() as usize
    }

    /// Length of the entire packet in words, header included.
    pub fn length_words(&self) -> usize {
        self.words_less_one as usize + 1
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[0] = 0b10_0_00000 | (self.feedback_message_type.count() & 0b0001_1111);
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
        4
    }
}

impl<'a> TryFrom<&'a [u8]> for RtcpHeader {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 4 {
            return Err("Need 4 bytes for RTCP header");
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            return Err("RTCP version is not 2");
        }

        let count = buf[0] & 0b0001_1111;
        let rtcp_type: RtcpType = buf[1].try_into()?;

        use RtcpType::*;
        let feedback_message_type = match rtcp_type {
            SenderReport | ReceiverReport => FeedbackMessageType::ReceptionReport(count),
            SourceDescription | Goodbye => FeedbackMessageType::SourceCount(count),
            TransportLayerFeedback => match count {
                1 => FeedbackMessageType::TransportFeedback(TransportType::Nack),
                15 => FeedbackMessageType::TransportFeedback(TransportType::TransportWide),
                _ => return Err("Unrecognized RTPFB fmt"),
            },
            PayloadSpecificFeedback => match count {
                1 => FeedbackMessageType::PayloadFeedback(PayloadType::PictureLossIndication),
                2 => FeedbackMessageType::PayloadFeedback(PayloadType::SliceLossIndication),
                3 => FeedbackMessageType::PayloadFeedback(
                    PayloadType::ReferencePictureSelectionIndication,
                ),
                4 => FeedbackMessageType::PayloadFeedback(PayloadType::FullIntraRequest),
                15 => FeedbackMessageType::PayloadFeedback(PayloadType::ApplicationLayer),
                _ => return Err("Unrecognized PSFB fmt"),
            },
            ApplicationDefined | ExtendedReport => FeedbackMessageType::NotUsed,
        };

        let words_less_one = u16::from_be_bytes([buf[2], buf[3]]);

        Ok(RtcpHeader {
            rtcp_type,
            feedback_message_type,
            words_less_one,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_rr_header() {
        let header = RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            feedback_message_type: FeedbackMessageType::ReceptionReport(2),
            words_less_one: 13,
        };

        let mut buf = [0u8; 4];
        header.write_to(&mut buf);

        let parsed: RtcpHeader = buf.as_slice().try_into().unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.count(), 2);
        assert_eq!(parsed.length_words(), 14);
    }

    #[test]
    fn rejects_bad_version() {
        let buf = [0u8, 201, 0, 1];
        let r: Result<RtcpHeader, _> = buf.as_slice().try_into();
        assert!(r.is_err());
    }

    #[test]
    fn parses_twcc_fmt() {
        let buf = [0b10_0_01111, 205, 0, 5];
        let h: RtcpHeader = buf.as_slice().try_into().unwrap();
        assert_eq!(
            h.feedback_message_type(),
            FeedbackMessageType::TransportFeedback(TransportType::TransportWide)
        );
    }
}
