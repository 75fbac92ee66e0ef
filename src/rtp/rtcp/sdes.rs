use std::str::from_utf8;

use super::list::WordSized;
use super::{pad_bytes_to_word, ReportList, RtcpHeader, RtcpPacket};
use super::{FeedbackMessageType, RtcpType, Ssrc};

/// Source descriptions (SDES).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptions {
    /// One chunk per described source.
    pub reports: ReportList<Sdes>,
}

/// A single source description chunk.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub ssrc: Ssrc,
    pub values: Vec<(SdesType, String)>,
}

/// Types of SDES items.
#[allow(clippy::upper_case_acronyms)]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdesType {
    /// End of item list.
    END = 0,
    /// Canonical name.
    CNAME = 1,
    NAME = 2,
    EMAIL = 3,
    PHONE = 4,
    LOC = 5,
    TOOL = 6,
    NOTE = 7,
    PRIV = 8,
    /// Unrecognized type, skipped on parse.
    Unknown,
}

impl Descriptions {
    /// Convenience for the common single CNAME chunk.
    pub fn cname(ssrc: Ssrc, cname: &str) -> Self {
        Descriptions {
            reports: Sdes {
                ssrc,
                values: vec![(SdesType::CNAME, cname.to_string())],
            }
            .into(),
        }
    }
}

impl RtcpPacket for Descriptions {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SourceDescription,
            feedback_message_type: FeedbackMessageType::SourceCount(self.reports.len() as u8),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        1 + self.reports.iter().map(|r| r.word_size()).sum::<usize>()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        let mut buf = &mut buf[4..];
        let mut total = 4;

        for r in &self.reports {
            let n = r.write_to(buf);
            buf = &mut buf[n..];
            total += n;
        }

        total
    }
}

impl Sdes {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[..4].copy_from_slice(&self.ssrc.to_be_bytes());
        let mut total = 4;

        let mut buf = &mut buf[4..];
        for (t, v) in &self.values {
            let bytes = v.as_bytes();
            let len = bytes.len();

            buf[0] = *t as u8;
            buf[1] = len as u8;
            buf[2..2 + len].copy_from_slice(bytes);

            buf = &mut buf[2 + len..];
            total += 2 + len;
        }

        buf[0] = SdesType::END as u8;
        buf = &mut buf[1..];
        total += 1;

        // Pad with END bytes to the word boundary.
        let pad = 4 - total % 4;
        if pad < 4 {
            for b in buf.iter_mut().take(pad) {
                *b = SdesType::END as u8;
            }
            total += pad;
        }

        total
    }
}

impl WordSized for Sdes {
    fn word_size(&self) -> usize {
        let bytes = 4 + self.values.iter().map(|(_, s)| 2 + s.len()).sum::<usize>() + 1;
        pad_bytes_to_word(bytes) / 4
    }
}

impl From<u8> for SdesType {
    fn from(v: u8) -> Self {
        use SdesType::*;
        match v {
            0 => END,
            1 => CNAME,
            2 => NAME,
            3 => EMAIL,
            4 => PHONE,
            5 => LOC,
            6 => TOOL,
            7 => NOTE,
            8 => PRIV,
            _ => Unknown,
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Descriptions {
    type Error = &'static str;

    fn try_from(mut buf: &'a [u8]) -> Result<Self, Self::Error> {
        let mut reports = ReportList::new();

        loop {
            if reports.is_full() || buf.len() < 8 {
                break;
            }

            let report: Sdes = buf.try_into()?;
            let len = report.word_size() * 4;
            buf = &buf[len..];

            reports.push(report);
        }

        Ok(Descriptions { reports })
    }
}

impl<'a> TryFrom<&'a [u8]> for Sdes {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Less than 8 bytes for Sdes");
        }

        let ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let mut values = vec![];

        let mut buf = &buf[4..];

        loop {
            // A lone END byte terminates the chunk even without a length.
            if buf.is_empty() || buf[0] == SdesType::END as u8 {
                break;
            }

            if buf.len() < 2 {
                return Err("Less than 2 bytes for next Sdes item");
            }

            let stype: SdesType = buf[0].into();
            let len = buf[1] as usize;

            if buf.len() < 2 + len {
                return Err("Sdes item length exceeds buffer");
            }

            if let Ok(value) = from_utf8(&buf[2..2 + len]) {
                values.push((stype, value.to_string()));
            }

            buf = &buf[2 + len..];
        }

        Ok(Sdes { ssrc, values })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cname_roundtrip() {
        let d1 = Descriptions::cname(42.into(), "abc123");

        let mut buf = vec![0; 64];
        let n = d1.write_to(&mut buf);
        buf.truncate(n);
        assert_eq!(n, d1.length_words() * 4);

        let d2: Descriptions = buf[4..].as_ref().try_into().unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn word_size_matches_write() {
        let mut buf = vec![0; 1500];

        for i in 1usize..=100 {
            let sdes = Sdes {
                ssrc: 1.into(),
                values: vec![(SdesType::CNAME, "a".repeat(i))],
            };
            assert_eq!(sdes.write_to(&mut buf), sdes.word_size() * 4);
        }
    }
}
