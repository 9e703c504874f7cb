// Protocol messages exchanged between simulation clients and the fabric
// server.
//
// Two enums define the full vocabulary:
// - `ClientMessage`: sent by a client over its session conduit.
// - `ServerMessage`: sent by the fabric server to one client.
//
// Three planes share the conduit. Sync traffic (`ResetReady`, `AdvanceTime`
// and their replies) drives the reset barrier and the time server. Data-plane
// traffic is `Frame`, routed by the switch fabric on its Ethernet addresses.
// Config-plane traffic is `Config`, routed only between a session and the
// control processor. Frame and config payloads are opaque `Vec<u8>`.

use serde::{Deserialize, Serialize};

use crate::types::{LogicalTime, MacAddress, PortIndex, ResetEpoch, SessionIndex};

/// Version carried in `Hello`. The server rejects any other value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a client to the fabric server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Session handshake. Must be the first message on a conduit.
    Hello { protocol_version: u32, name: String },
    /// The client is out of reset and ready for the barrier to release.
    ResetReady,
    /// Ask to advance local logical time to `target`.
    AdvanceTime { target: LogicalTime },
    /// A data-plane frame entering the switch on this session's port.
    Frame(EthernetFrame),
    /// Out-of-band configuration for the control processor.
    Config { payload: Vec<u8> },
    /// The client is leaving.
    Goodbye,
}

/// Messages sent by the fabric server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome {
        session: SessionIndex,
        session_count: u32,
        reset_interval: u64,
    },
    /// Handshake refused; the server closes the conduit.
    Rejected { reason: String },
    /// Every session reported ready; the barrier moved to `epoch`.
    ResetReleased {
        epoch: ResetEpoch,
        reset_interval: u64,
    },
    /// The pending `ResetReady` can never be released: the quorum lost a
    /// session.
    ResetAborted { reason: String },
    /// The pending `AdvanceTime` is authorized.
    TimeGranted { time: LogicalTime },
    /// The pending `AdvanceTime` violated time monotonicity.
    AdvanceRejected { reason: String },
    /// A frame forwarded to this client, tagged with the port it entered on.
    Frame {
        ingress: PortIndex,
        frame: EthernetFrame,
    },
    /// Configuration from the control processor.
    Config { payload: Vec<u8> },
    /// The server is shutting the session down.
    Shutdown,
}

/// An Ethernet-style frame. Only the two addresses are read by the fabric.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// IPv4 EtherType, the common case for simulated TCP/UDP traffic.
    pub const ETHER_TYPE_IPV4: u16 = 0x0800;

    pub fn new(destination: MacAddress, source: MacAddress, payload: Vec<u8>) -> Self {
        Self {
            destination,
            source,
            ether_type: Self::ETHER_TYPE_IPV4,
            payload,
        }
    }

    /// Size on an Ethernet wire: two addresses, EtherType, payload.
    pub fn wire_len(&self) -> usize {
        14 + self.payload.len()
    }
}
