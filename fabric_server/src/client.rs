// Blocking client for the fabric protocol.
//
// What a simulation node links against to join the fabric. Architecture:
// - `connect()`/`over()` run the Hello handshake on the calling thread,
//   then spawn a background reader thread.
// - The reader thread calls `Conduit::receive()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel.
// - Sends go straight out through the conduit from the calling thread.
// - The `await_*`/`recv_*` calls wait on the channel for one kind of message
//   and stash anything else, so frames that arrive while the node waits for
//   a time grant are not lost.
//
// Lives in the server crate because it is only std + protocol framing +
// mpsc; integration tests and embedding harnesses use it directly.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fabric_protocol::framing::{decode, encode};
use fabric_protocol::{
    ClientMessage, EthernetFrame, LogicalTime, PROTOCOL_VERSION, PortIndex, ResetEpoch,
    ServerMessage, SessionIndex,
};
use thiserror::Error;

use crate::conduit::{self, Conduit, Endpoint};
use crate::control::SimControl;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("reset aborted: {0}")]
    ResetAborted(String),
    #[error("advance refused: {0}")]
    AdvanceRefused(String),
    #[error("unexpected message: {0}")]
    Unexpected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("server shut the session down")]
    Shutdown,
    #[error("connection closed")]
    Closed,
}

/// A connected fabric client.
pub struct FabricClient {
    conduit: Arc<dyn Conduit>,
    inbox: Receiver<ServerMessage>,
    stash: VecDeque<ServerMessage>,
    reader_thread: Option<JoinHandle<()>>,
    session: SessionIndex,
    session_count: u32,
    reset_interval: u64,
    timeout: Duration,
    closed: bool,
}

impl FabricClient {
    /// Connect to a session endpoint and complete the handshake.
    pub fn connect(endpoint: &Endpoint, name: &str) -> Result<Self, ClientError> {
        Self::over(conduit::connect(endpoint)?, name)
    }

    /// Complete the handshake over an already open conduit.
    pub fn over(conduit: Arc<dyn Conduit>, name: &str) -> Result<Self, ClientError> {
        conduit.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        conduit.send(&encode(&ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: name.into(),
        })?)?;

        let reply: ServerMessage = decode(&conduit.receive()?)?;
        let (session, session_count, reset_interval) = match reply {
            ServerMessage::Welcome {
                session,
                session_count,
                reset_interval,
            } => (session, session_count, reset_interval),
            ServerMessage::Rejected { reason } => {
                conduit.close();
                return Err(ClientError::Rejected(reason));
            }
            other => {
                conduit.close();
                return Err(ClientError::Unexpected(format!("{other:?}")));
            }
        };
        conduit.set_read_timeout(None)?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = {
            let conduit = Arc::clone(&conduit);
            thread::Builder::new()
                .name(format!("fabric-client-{}", session.0))
                .spawn(move || reader_loop(conduit.as_ref(), tx))?
        };

        Ok(Self {
            conduit,
            inbox: rx,
            stash: VecDeque::new(),
            reader_thread: Some(reader_thread),
            session,
            session_count,
            reset_interval,
            timeout: DEFAULT_TIMEOUT,
            closed: false,
        })
    }

    /// Session index the server assigned.
    pub fn session(&self) -> SessionIndex {
        self.session
    }

    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    /// Reset interval announced by the server, ns.
    pub fn reset_interval(&self) -> u64 {
        self.reset_interval
    }

    /// How long `await_*`/`recv_*` wait before `Timeout`.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn send_message(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.conduit.send(&encode(msg)?)?;
        Ok(())
    }

    /// Report ready and block until the reset barrier releases.
    pub fn wait_for_reset(&mut self) -> Result<ResetEpoch, ClientError> {
        self.send_message(&ClientMessage::ResetReady)?;
        self.await_reset()
    }

    /// Wait for the answer to a `ResetReady` already sent.
    pub fn await_reset(&mut self) -> Result<ResetEpoch, ClientError> {
        self.wait_for("reset release", |msg| match msg {
            ServerMessage::ResetReleased { epoch, .. } => Ok(Ok(epoch)),
            ServerMessage::ResetAborted { reason } => Ok(Err(reason)),
            other => Err(other),
        })?
        .map_err(ClientError::ResetAborted)
    }

    /// Ask to advance to `target` and block until granted or refused.
    pub fn advance_to(&mut self, target: LogicalTime) -> Result<LogicalTime, ClientError> {
        self.send_message(&ClientMessage::AdvanceTime { target })?;
        self.await_grant()
    }

    /// Wait for the answer to an `AdvanceTime` already sent.
    pub fn await_grant(&mut self) -> Result<LogicalTime, ClientError> {
        self.wait_for("time grant", |msg| match msg {
            ServerMessage::TimeGranted { time } => Ok(Ok(time)),
            ServerMessage::AdvanceRejected { reason } => Ok(Err(reason)),
            other => Err(other),
        })?
        .map_err(ClientError::AdvanceRefused)
    }

    pub fn send_frame(&self, frame: EthernetFrame) -> Result<(), ClientError> {
        self.send_message(&ClientMessage::Frame(frame))
    }

    /// Next frame forwarded to this client, with the port it entered on.
    pub fn recv_frame(&mut self) -> Result<(PortIndex, EthernetFrame), ClientError> {
        self.wait_for("frame", |msg| match msg {
            ServerMessage::Frame { ingress, frame } => Ok((ingress, frame)),
            other => Err(other),
        })
    }

    pub fn send_config(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        self.send_message(&ClientMessage::Config { payload })
    }

    pub fn recv_config(&mut self) -> Result<Vec<u8>, ClientError> {
        self.wait_for("config", |msg| match msg {
            ServerMessage::Config { payload } => Ok(payload),
            other => Err(other),
        })
    }

    /// Next config payload that parses as a `SimControl` block. Other
    /// config is discarded.
    pub fn recv_sim_control(&mut self) -> Result<SimControl, ClientError> {
        loop {
            let payload = self.recv_config()?;
            if let Some(control) = SimControl::from_payload(&payload) {
                return Ok(control);
            }
        }
    }

    /// Say goodbye and close the conduit. Idempotent.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        // The server may already be gone; closing is all that matters then.
        let _ = self.send_message(&ClientMessage::Goodbye);
        self.closed = true;
        self.conduit.close();
    }

    /// Wait for the first message `pick` accepts. Messages it hands back are
    /// stashed for later calls. A `Shutdown` ends every wait.
    fn wait_for<T>(
        &mut self,
        what: &'static str,
        mut pick: impl FnMut(ServerMessage) -> Result<T, ServerMessage>,
    ) -> Result<T, ClientError> {
        let mut found = None;
        let mut kept = VecDeque::with_capacity(self.stash.len());
        for msg in self.stash.drain(..) {
            if found.is_some() {
                kept.push_back(msg);
                continue;
            }
            match pick(msg) {
                Ok(value) => found = Some(value),
                Err(msg) => kept.push_back(msg),
            }
        }
        self.stash = kept;
        if let Some(value) = found {
            return Ok(value);
        }
        if self.stash.contains(&ServerMessage::Shutdown) {
            return Err(ClientError::Shutdown);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok(msg) => match pick(msg) {
                    Ok(value) => return Ok(value),
                    Err(ServerMessage::Shutdown) => {
                        self.stash.push_back(ServerMessage::Shutdown);
                        return Err(ClientError::Shutdown);
                    }
                    Err(other) => self.stash.push_back(other),
                },
                Err(RecvTimeoutError::Timeout) => return Err(ClientError::Timeout(what)),
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Closed),
            }
        }
    }
}

impl Drop for FabricClient {
    fn drop(&mut self) {
        self.conduit.close();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Reader thread: receive framed messages in a loop, push to channel.
fn reader_loop(conduit: &dyn Conduit, tx: Sender<ServerMessage>) {
    while let Ok(body) = conduit.receive() {
        match decode::<ServerMessage>(&body) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
