//! BLE device addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 6-byte BLE MAC address, stored in display order (`AA:BB:...` → `[0xAA, 0xBB, ...]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseAddressError(pub String);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Byte order used inside proxy packets (little-endian, as the radio sees it)
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);

        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseAddressError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseAddressError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_uppercase() {
        let addr: MacAddress = "aa:bb:cc:01:02:03".parse().unwrap();
        assert_eq!(addr.0, [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_string(), "AA:BB:CC:01:02:03");
    }

    #[test]
    fn rejects_malformed() {
        assert!("AA:BB:CC".parse::<MacAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<MacAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<MacAddress>().is_err());
        assert!("AAB:B:CC:DD:EE:FF".parse::<MacAddress>().is_err());
    }

    #[test]
    fn little_endian_order_is_reversed() {
        let addr: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        assert_eq!(addr.to_le_bytes(), [6, 5, 4, 3, 2, 1]);
        assert_eq!(MacAddress::from_le_bytes(addr.to_le_bytes()), addr);
    }

    #[test]
    fn serializes_as_string() {
        let addr: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
