use std::fmt;
use std::ops::Deref;
use std::str::from_utf8;

use serde::{Deserialize, Serialize};

macro_rules! str_id {
    ($id:ident, $name:literal, $num:tt) => {
        impl $id {
            /// Converts an array of bytes to an id.
            pub const fn from_array(a: [u8; $num]) -> $id {
                $id(a)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s: &str = self;
                write!(f, "{}", s)
            }
        }

        impl fmt::Debug for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s: &str = self;
                write!(f, "{}({})", $name, s)
            }
        }

        impl Deref for $id {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                from_utf8(&self.0).expect("ascii id").trim_end()
            }
        }

        impl<'a> From<&'a str> for $id {
            fn from(v: &'a str) -> Self {
                let bytes = v.as_bytes();
                let mut array = [b' '; $num];

                let max = bytes.len().min(array.len());
                array[..max].copy_from_slice(&bytes[..max]);

                $id(array)
            }
        }
    };
}

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Media identifier carried in the `sdes:mid` RTP header extension.
///
/// Identifies which producer an incoming packet belongs to before any
/// SSRC binding has been learned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mid([u8; 16]);
str_id!(Mid, "Mid", 16);

/// RTP stream identifier for one encoding (simulcast layer) of a producer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid([u8; 8]);
str_id!(Rid, "Rid", 8);

/// Synchronization source. Identifies one stream of RTP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

impl Ssrc {
    pub(crate) fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// RTP payload type, 7 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pt(u8);
num_id!(Pt, u8);

/// Extended RTP sequence number.
///
/// The wire sequence number is 16 bits and rolls over quickly. We track
/// rollovers and widen to 64 bits so a packet is uniquely identified by
/// SSRC + SeqNo. Use `as_u16()` (or cast) to get the wire value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqNo(u64);
num_id!(SeqNo, u64);

impl SeqNo {
    /// The wire representation (lower 16 bits).
    #[inline(always)]
    pub fn as_u16(&self) -> u16 {
        self.0 as u16
    }

    /// Whether `other` directly follows this sequence number.
    #[inline(always)]
    pub fn is_next(&self, other: SeqNo) -> bool {
        self.0 < other.0 && other.0 - self.0 == 1
    }

    /// Increase (mutate) this sequence number and return the previous value.
    #[inline(always)]
    pub fn inc(&mut self) -> SeqNo {
        let n = SeqNo(self.0);
        self.0 += 1;
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mid_from_str_and_back() {
        let m = Mid::from("a");
        assert_eq!(&*m, "a");
        assert_eq!(format!("{}", m), "a");

        let long = Mid::from("0123456789abcdefXX");
        assert_eq!(&*long, "0123456789abcdef");
    }

    #[test]
    fn seq_no_next() {
        let s: SeqNo = 65_535.into();
        assert!(s.is_next(65_536.into()));
        assert!(!s.is_next(65_537.into()));
        assert!(!s.is_next(65_535.into()));
    }
}
