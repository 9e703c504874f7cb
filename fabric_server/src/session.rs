// Session table: one slot per client, tracking connection state and the
// conduit the server writes through.
//
// A slot moves Disconnected → Listening (endpoint bound) → Connected
// (handshake done) → Disconnecting (teardown in progress) → Disconnected.
// Only the transition into Disconnecting hands out the conduit for teardown,
// so however many threads notice a dead client at once, exactly one of them
// runs the disconnect.
//
// The handshake mirrors the first exchange on every conduit: the client sends
// `Hello` within the handshake timeout, the server answers `Welcome` with the
// session index it was given, or `Rejected` and closes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabric_protocol::framing::{decode, encode};
use fabric_protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage, SessionIndex};
use tracing::{debug, warn};

use crate::conduit::Conduit;
use crate::error::{FabricError, FabricResult};
use crate::lock;

/// Connection state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Listening,
    Connected,
    Disconnecting,
}

struct Slot {
    state: SessionState,
    name: String,
    conduit: Option<Arc<dyn Conduit>>,
}

/// Fixed-size table of sessions, indexed by `SessionIndex`.
pub struct SessionTable {
    slots: Vec<Mutex<Slot>>,
}

impl SessionTable {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|_| {
                Mutex::new(Slot {
                    state: SessionState::Disconnected,
                    name: String::new(),
                    conduit: None,
                })
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: SessionIndex) -> Option<&Mutex<Slot>> {
        self.slots.get(index.as_usize())
    }

    /// State of `index`; indices past the table are always `Disconnected`.
    pub fn state(&self, index: SessionIndex) -> SessionState {
        self.slot(index)
            .map_or(SessionState::Disconnected, |slot| lock(slot).state)
    }

    /// Client name from the handshake, empty before one completes.
    pub fn name(&self, index: SessionIndex) -> String {
        self.slot(index)
            .map(|slot| lock(slot).name.clone())
            .unwrap_or_default()
    }

    pub fn set_listening(&self, index: SessionIndex) {
        if let Some(slot) = self.slot(index) {
            let mut slot = lock(slot);
            if slot.state == SessionState::Disconnected {
                slot.state = SessionState::Listening;
            }
        }
    }

    /// Return a listening slot to `Disconnected` when its endpoint goes away
    /// without a client.
    pub fn stop_listening(&self, index: SessionIndex) {
        if let Some(slot) = self.slot(index) {
            let mut slot = lock(slot);
            if slot.state == SessionState::Listening {
                slot.state = SessionState::Disconnected;
            }
        }
    }

    /// Bind a handshaken conduit to `index`.
    pub fn connect(
        &self,
        index: SessionIndex,
        name: String,
        conduit: Arc<dyn Conduit>,
    ) -> FabricResult<()> {
        let slot = self
            .slot(index)
            .ok_or_else(|| FabricError::connect(index, "no such session"))?;
        let mut slot = lock(slot);
        match slot.state {
            SessionState::Connected | SessionState::Disconnecting => Err(FabricError::connect(
                index,
                "session already has a client",
            )),
            SessionState::Disconnected | SessionState::Listening => {
                slot.state = SessionState::Connected;
                slot.name = name;
                slot.conduit = Some(conduit);
                Ok(())
            }
        }
    }

    /// Conduit of a connected session.
    pub fn conduit(&self, index: SessionIndex) -> Option<Arc<dyn Conduit>> {
        let slot = lock(self.slot(index)?);
        match slot.state {
            SessionState::Connected => slot.conduit.clone(),
            _ => None,
        }
    }

    /// Start tearing down `index`. Returns the conduit to the one caller
    /// that wins the Connected → Disconnecting transition; everyone else
    /// gets `None`.
    pub fn begin_disconnect(&self, index: SessionIndex) -> Option<Arc<dyn Conduit>> {
        let mut slot = lock(self.slot(index)?);
        match slot.state {
            SessionState::Connected => {
                slot.state = SessionState::Disconnecting;
                slot.conduit.take()
            }
            SessionState::Listening => {
                slot.state = SessionState::Disconnected;
                None
            }
            SessionState::Disconnecting | SessionState::Disconnected => None,
        }
    }

    pub fn finish_disconnect(&self, index: SessionIndex) {
        if let Some(slot) = self.slot(index) {
            let mut slot = lock(slot);
            slot.state = SessionState::Disconnected;
            slot.conduit = None;
        }
    }

    /// Indices of every connected session, in index order.
    pub fn connected(&self) -> Vec<SessionIndex> {
        (0..self.slots.len())
            .map(|i| SessionIndex(i as u32))
            .filter(|&index| self.state(index) == SessionState::Connected)
            .collect()
    }

    /// Encode `msg` and write it to `index`. Fails with `SessionClosed` if
    /// the session has no live conduit.
    pub fn send(&self, index: SessionIndex, msg: &ServerMessage) -> FabricResult<()> {
        let conduit = self
            .conduit(index)
            .ok_or(FabricError::SessionClosed(index))?;
        let body = encode(msg)?;
        conduit.send(&body).map_err(|e| {
            debug!(%index, error = %e, "send failed");
            FabricError::SessionClosed(index)
        })
    }
}

/// Parameters the server announces in `Welcome`.
#[derive(Clone, Copy, Debug)]
pub struct Greeting {
    pub session_count: u32,
    pub reset_interval: u64,
    pub timeout: Duration,
}

/// Read the client's `Hello` on a fresh conduit and answer it. Returns the
/// client's name. On any failure the conduit is closed.
pub fn handshake(
    conduit: &dyn Conduit,
    index: SessionIndex,
    greeting: Greeting,
) -> FabricResult<String> {
    let result = exchange_hello(conduit, index, greeting);
    if let Err(e) = &result {
        warn!(%index, peer = %conduit.peer(), error = %e, "handshake failed");
        conduit.close();
    }
    result
}

fn exchange_hello(
    conduit: &dyn Conduit,
    index: SessionIndex,
    greeting: Greeting,
) -> FabricResult<String> {
    let fail = |reason: String| FabricError::connect(index, reason);

    conduit.set_read_timeout(Some(greeting.timeout))?;
    let body = conduit
        .receive()
        .map_err(|e| fail(format!("no hello: {e}")))?;
    let hello: ClientMessage = decode(&body).map_err(|e| fail(format!("bad hello: {e}")))?;

    let (protocol_version, name) = match hello {
        ClientMessage::Hello {
            protocol_version,
            name,
        } => (protocol_version, name),
        other => return Err(fail(format!("expected hello, got {other:?}"))),
    };

    if protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version {protocol_version} is not supported (server speaks {PROTOCOL_VERSION})"
        );
        let rejected = encode(&ServerMessage::Rejected {
            reason: reason.clone(),
        })?;
        // The client is about to be dropped either way.
        let _ = conduit.send(&rejected);
        return Err(fail(reason));
    }

    let welcome = encode(&ServerMessage::Welcome {
        session: index,
        session_count: greeting.session_count,
        reset_interval: greeting.reset_interval,
    })?;
    conduit
        .send(&welcome)
        .map_err(|e| fail(format!("cannot send welcome: {e}")))?;
    conduit.set_read_timeout(None)?;
    Ok(name)
}
