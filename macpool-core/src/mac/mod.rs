use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub mod range;

pub use range::{MacRange, WrappingMacIterator};

const MAC_MAX: u64 = (1 << 48) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    #[error("'{}' is not a valid MAC address!", .0)]
    Malformed(String),
    #[error("{:#x} doesn't fit in 48 bits!", .0)]
    Overflow(u64),
    #[error("Range start {} is greater than range end {}!", .0, .1)]
    InvertedRange(MacAddress, MacAddress),
}

/// 48-bit hardware address, stored as an integer in network byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress(u64);

impl MacAddress {
    pub fn from_u64(value: u64) -> Result<Self, MacError> {
        match value > MAC_MAX {
            true => Err(MacError::Overflow(value)),
            false => Ok(Self(value)),
        }
    }

    pub fn from_octets(octets: [u8; 6]) -> Self {
        let mut padded = [0u8; 8];
        padded[2..].copy_from_slice(&octets);

        Self(u64::from_be_bytes(padded))
    }

    pub fn octets(&self) -> [u8; 6] {
        let bytes = self.0.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..]);

        octets
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        Self::from_octets(value)
    }
}

impl From<MacAddress> for u64 {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl TryFrom<u64> for MacAddress {
    type Error = MacError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_u64(value)
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.octets();
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MacError::Malformed(s.to_owned());
        let trimmed = s.trim();
        let separator = match trimmed.contains('-') {
            true => '-',
            false => ':',
        };

        let mut octets = [0u8; 6];
        let mut groups = trimmed.split(separator);

        for octet in octets.iter_mut() {
            let group = groups.next().ok_or_else(malformed)?;

            if group.len() != 2 || !group.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(malformed());
            }

            *octet = u8::from_str_radix(group, 16).map_err(|_| malformed())?;
        }

        if groups.next().is_some() {
            return Err(malformed());
        }

        Ok(Self::from_octets(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{MacAddress, MacError};

    #[test]
    fn parses_colon_and_dash_notation() {
        let colon: MacAddress = "02:00:0A:ff:00:01".parse().unwrap();
        let dash: MacAddress = "02-00-0a-FF-00-01".parse().unwrap();

        assert_eq!(colon, dash);
        assert_eq!(colon.as_u64(), 0x0200_0aff_0001);
        assert_eq!(colon.to_string(), "02:00:0a:ff:00:01");
    }

    #[test]
    fn rejects_malformed_addresses() {
        let malformed = [
            "",
            "02:00:00:00:00",
            "02:00:00:00:00:00:00",
            "2:00:00:00:00:00",
            "zz:00:00:00:00:00",
            "02:00-00:00:00:00",
            "+2:+0:00:00:00:01",
            "02:00:00:00:00:+1",
        ];

        for raw in malformed {
            assert_eq!(
                raw.parse::<MacAddress>(),
                Err(MacError::Malformed(raw.to_owned())),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn integer_conversion_is_bit_exact() {
        let mac = MacAddress::from_u64(0xfedc_ba98_7654).unwrap();

        assert_eq!(mac.octets(), [0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54]);
        assert_eq!(MacAddress::from_octets(mac.octets()), mac);
        assert_eq!(mac.to_string().parse::<MacAddress>().unwrap(), mac);
        assert_eq!(MacAddress::from_u64(1 << 48), Err(MacError::Overflow(1 << 48)));
    }

    #[test]
    fn serializes_as_text() {
        let mac: MacAddress = "02:00:00:00:00:2a".parse().unwrap();

        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"02:00:00:00:00:2a\"");
        assert_eq!(serde_json::from_str::<MacAddress>("\"02:00:00:00:00:2a\"").unwrap(), mac);
    }
}
