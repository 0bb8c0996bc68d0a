use std::fmt;
use std::str::FromStr;

/// Largest valid AS number (48 bits).
pub const MAX_ASN: u64 = (1 << 48) - 1;

/// Largest AS number that uses the decimal notation.
const MAX_DECIMAL_ASN: u64 = (1 << 32) - 1;

const GROUP_BITS: u32 = 16;
const GROUP_MAX: u64 = 0xffff;
const GROUPS: usize = 3;

/// A SCION AS number.
///
/// AS numbers are 48 bits wide. Values below 2^32 use the decimal BGP
/// notation, larger values are written as three colon-separated groups of up
/// to four hex digits.
///
/// ```
/// use peering_coordinator_store::asn::Asn;
///
/// assert_eq!("64496".parse::<Asn>().unwrap().as_u64(), 64496);
/// assert_eq!("1:0:0".parse::<Asn>().unwrap().as_u64(), 1 << 32);
/// assert_eq!("ff00:0:110".parse::<Asn>().unwrap().to_string(), "ff00:0:110");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Asn(u64);

impl Asn {
    pub fn new(value: u64) -> Result<Self, AsnParseError> {
        if value > MAX_ASN {
            Err(AsnParseError::OutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 <= MAX_DECIMAL_ASN {
            write!(f, "{}", self.0)
        } else {
            write!(
                f,
                "{:x}:{:x}:{:x}",
                (self.0 >> (2 * GROUP_BITS)) & GROUP_MAX,
                (self.0 >> GROUP_BITS) & GROUP_MAX,
                self.0 & GROUP_MAX
            )
        }
    }
}

impl FromStr for Asn {
    type Err = AsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            let groups: Vec<&str> = s.split(':').collect();
            if groups.len() != GROUPS {
                return Err(AsnParseError::WrongGroupCount(groups.len()));
            }

            let mut value = 0u64;
            for group in groups {
                let group = u64::from_str_radix(group, 16)
                    .ok()
                    .filter(|v| *v <= GROUP_MAX)
                    .ok_or_else(|| AsnParseError::InvalidHexGroup(s.to_string()))?;
                value = (value << GROUP_BITS) | group;
            }

            Ok(Self(value))
        } else {
            let value = s
                .parse::<u64>()
                .ok()
                .filter(|v| *v <= MAX_DECIMAL_ASN)
                .ok_or_else(|| AsnParseError::InvalidDecimal(s.to_string()))?;

            Ok(Self(value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsnParseError {
    OutOfRange(u64),
    InvalidDecimal(String),
    InvalidHexGroup(String),
    WrongGroupCount(usize),
}

impl std::error::Error for AsnParseError {}

impl fmt::Display for AsnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(value) => write!(f, "Out of range for an ASN: {value}"),
            Self::InvalidDecimal(s) => write!(f, "Invalid decimal ASN: {s}"),
            Self::InvalidHexGroup(s) => write!(f, "Invalid hexadecimal ASN: {s}"),
            Self::WrongGroupCount(count) => {
                write!(f, "Wrong number of colon-separated groups: {count}")
            }
        }
    }
}
