use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WaptError;

/// A 48-bit hardware address. Displays as lowercase colon-separated hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// `02:00:00:00:00:nn`, the locally administered range used for
    /// numbered profiles so each one advertises a stable BSSID.
    pub fn locally_administered(index: u8) -> Self {
        MacAddr([0x02, 0, 0, 0, 0, index])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = WaptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(WaptError::parse("MAC address", format!("'{trimmed}' needs six octets")));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(WaptError::parse(
                    "MAC address",
                    format!("octet '{part}' in '{trimmed}' is not two hex digits"),
                ));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| {
                WaptError::parse("MAC address", format!("octet '{part}' in '{trimmed}' is not hex"))
            })?;
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = WaptError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}
