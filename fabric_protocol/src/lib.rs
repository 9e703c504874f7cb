// fabric_protocol: wire protocol between the fabric coordination server and
// its simulation clients.
//
// This crate defines the message types, id newtypes and framing used on every
// session conduit. It is shared by the server and by client code and depends
// on nothing but serde.
//
// Module overview:
// - `types.rs`:    `SessionIndex`, `PortIndex`, `ResetEpoch`, `LogicalTime`,
//                  `MacAddress`.
// - `message.rs`:  `ClientMessage` / `ServerMessage` enums and the
//                  `EthernetFrame` carried on the data plane.
// - `framing.rs`:  4-byte big-endian length prefix + JSON body over any
//                  `Read`/`Write` stream, plus typed send/recv helpers.
//
// Design decisions:
// - **JSON bodies.** Human-readable on the wire and trivially produced by
//   clients in other languages. Frame payloads are small.
// - **Opaque payloads.** The server reads frame addresses but never the frame
//   payload or config payload bytes.
// - **Blocking std I/O.** Framing works on `std::io` traits so it fits both
//   TCP and Unix-domain streams as well as in-memory buffers in tests.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, decode, encode, read_message, write_message};
pub use message::{ClientMessage, EthernetFrame, PROTOCOL_VERSION, ServerMessage};
pub use types::{LogicalTime, MacAddress, ParseMacError, PortIndex, ResetEpoch, SessionIndex};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x00, 0x10, 0xaa, 0x00, 0x00, last])
    }

    /// Frame a message, read it back, and compare.
    fn through_the_wire<T>(msg: &T) -> T
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let mut wire = Vec::new();
        write_message(&mut wire, &encode(msg).unwrap()).unwrap();
        let mut cursor = Cursor::new(&wire);
        decode(&read_message(&mut cursor).unwrap()).unwrap()
    }

    #[test]
    fn frame_payload_bytes_are_preserved() {
        let payload: Vec<u8> = (0..=255).collect();
        let msg = ClientMessage::Frame(EthernetFrame::new(mac(2), mac(1), payload.clone()));
        match through_the_wire(&msg) {
            ClientMessage::Frame(frame) => {
                assert_eq!(frame.payload, payload);
                assert_eq!(frame.destination, mac(2));
                assert_eq!(frame.source, mac(1));
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn server_frame_carries_ingress_port() {
        let msg = ServerMessage::Frame {
            ingress: PortIndex(3),
            frame: EthernetFrame::new(MacAddress::BROADCAST, mac(4), vec![9]),
        };
        assert_eq!(through_the_wire(&msg), msg);
    }

    #[test]
    fn sync_messages_survive_the_wire() {
        let msgs = [
            ClientMessage::ResetReady,
            ClientMessage::AdvanceTime {
                target: LogicalTime(1_000),
            },
            ClientMessage::Goodbye,
        ];
        for msg in &msgs {
            assert_eq!(&through_the_wire(msg), msg);
        }
        let released = ServerMessage::ResetReleased {
            epoch: ResetEpoch(1),
            reset_interval: 100,
        };
        assert_eq!(through_the_wire(&released), released);
    }

    #[test]
    fn hello_names_protocol_version() {
        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: "PLCComponent".into(),
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"protocol_version\":1"), "{json}");
    }

    #[test]
    fn frame_wire_len_counts_header() {
        let frame = EthernetFrame::new(mac(1), mac(2), vec![0; 46]);
        assert_eq!(frame.wire_len(), 60);
    }
}
