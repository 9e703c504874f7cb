// Core ID and value types for the fabric protocol.
//
// Lightweight newtypes shared by `message.rs` and the server crate. Session
// and port indices are dense integers in `[0, N)`; the server assigns them by
// listening endpoint, not by anything the client claims. `MacAddress` is the
// only addressing the switch fabric reads out of a frame, and it serializes
// as the familiar colon-separated hex string so topology files stay readable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Index of a client session, in `[0, session_count)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionIndex(pub u32);

/// Index of a switch port. Port `i` is wired to session `i`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortIndex(pub u32);

/// Reset barrier cycle counter. Starts at 0 and only moves forward.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ResetEpoch(pub u64);

/// Logical simulation time in nanoseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogicalTime(pub u64);

impl SessionIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The switch port wired to this session.
    pub fn port(self) -> PortIndex {
        PortIndex(self.0)
    }
}

impl PortIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The session whose conduit backs this port.
    pub fn session(self) -> SessionIndex {
        SessionIndex(self.0)
    }
}

impl ResetEpoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl LogicalTime {
    pub fn saturating_add(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

impl fmt::Display for ResetEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ns", self.0)
    }
}

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group (multicast or broadcast) addresses have the low bit of the first
    /// octet set.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

/// Error returned when a string is not a colon- or dash-separated MAC.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address {0:?}: expected six hex octets like 00:10:aa:00:00:01")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.into()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.into()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.into()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.into()));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_display_and_parse_agree() {
        let mac = MacAddress([0x00, 0x10, 0xaa, 0x00, 0x00, 0x02]);
        assert_eq!(mac.to_string(), "00:10:aa:00:00:02");
        assert_eq!("00:10:AA:00:00:02".parse::<MacAddress>().unwrap(), mac);
        assert_eq!("00-10-aa-00-00-02".parse::<MacAddress>().unwrap(), mac);
    }

    #[test]
    fn mac_parse_rejects_garbage() {
        assert!("00:10:aa:00:00".parse::<MacAddress>().is_err());
        assert!("00:10:aa:00:00:02:03".parse::<MacAddress>().is_err());
        assert!("00:10:zz:00:00:02".parse::<MacAddress>().is_err());
        assert!("0:10:aa:00:00:02".parse::<MacAddress>().is_err());
    }

    #[test]
    fn broadcast_is_group() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(MacAddress::BROADCAST.is_group());
        assert!(!MacAddress([0x00, 0x10, 0xaa, 0, 0, 1]).is_group());
    }

    #[test]
    fn mac_serializes_as_string() {
        let mac = MacAddress([0x00, 0x10, 0xaa, 0x00, 0x00, 0x04]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"00:10:aa:00:00:04\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn session_and_port_are_wired_one_to_one() {
        assert_eq!(SessionIndex(3).port(), PortIndex(3));
        assert_eq!(PortIndex(2).session(), SessionIndex(2));
    }
}
