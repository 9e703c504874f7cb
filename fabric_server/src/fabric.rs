// The fabric: every shared component, plus the per-session threads that feed
// them.
//
// Threads per connected session:
// - **Reader** (`reader_loop`): blocks in `Conduit::receive`, decodes
//   `ClientMessage`, and dispatches by plane. Frames go straight to the
//   switch on the reader's own thread; config goes to the control plane's
//   inbound queue; `ResetReady`/`AdvanceTime` are handed to the worker over
//   an `mpsc` channel. `Goodbye`, EOF and malformed input end the loop and
//   disconnect the session.
// - **Sync worker** (`worker_loop`): the only thread that blocks in the
//   reset barrier or the time server for this session, so a client waiting
//   on a grant keeps receiving frames and config meanwhile.
//
// `disconnect` is idempotent and never joins: whichever thread notices first
// (reader on EOF, coordinator at shutdown) tears the session down, and the
// coordinator joins the threads afterwards.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use fabric_protocol::framing::{decode, encode};
use fabric_protocol::{ClientMessage, LogicalTime, PortIndex, ServerMessage, SessionIndex};
use tracing::{debug, info, warn};

use crate::conduit::Conduit;
use crate::config::FabricConfig;
use crate::control::ControlPlane;
use crate::error::{FabricError, FabricResult};
use crate::monitor::{FrameLog, TrafficMonitor};
use crate::reset_barrier::ResetBarrier;
use crate::session::{self, Greeting, SessionState, SessionTable};
use crate::switch::Switch;
use crate::time_sync::TimeSync;

/// Blocking requests a reader hands to its session's sync worker.
#[derive(Debug)]
enum SyncRequest {
    ResetReady,
    Advance(LogicalTime),
}

/// Join handles for one session's threads.
pub struct SessionThreads {
    index: SessionIndex,
    reader: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SessionThreads {
    /// Wait for both threads. Only call after the session was disconnected.
    pub fn join(self) {
        for (role, handle) in [("reader", self.reader), ("worker", self.worker)] {
            if handle.join().is_err() {
                warn!(index = %self.index, role, "session thread panicked");
            }
        }
    }
}

pub struct Fabric {
    greeting: Greeting,
    sessions: Arc<SessionTable>,
    switch: Arc<Switch>,
    barrier: ResetBarrier,
    time: TimeSync,
    control: Arc<ControlPlane>,
    traffic: Option<Arc<TrafficMonitor>>,
}

impl Fabric {
    pub fn new(config: &FabricConfig) -> FabricResult<Arc<Self>> {
        let count = config.session_count;
        let session_count = u32::try_from(count)
            .map_err(|_| FabricError::Argument(format!("{count} sessions is too many")))?;
        let topology = config.topology();

        let sessions = Arc::new(SessionTable::new(count));
        let switch = Arc::new(Switch::new(count, &topology, config.monitoring)?);
        let all_ports: Vec<PortIndex> = (0..session_count).map(PortIndex).collect();

        let traffic = if config.monitoring {
            let monitor = Arc::new(TrafficMonitor::new(count));
            switch.attach_monitor(monitor.clone(), &all_ports)?;
            Some(monitor)
        } else {
            None
        };
        if let Some(path) = &config.monitor_log {
            if !config.monitoring {
                warn!(path = %path.display(), "monitoring is off; frame log will stay empty");
            }
            let log = FrameLog::create(path).map_err(|e| {
                FabricError::Argument(format!("cannot create frame log {}: {e}", path.display()))
            })?;
            switch.attach_monitor(Arc::new(log), &all_ports)?;
        }

        let control = Arc::new(ControlPlane::new(Arc::clone(&sessions)));
        let barrier = {
            let switch = Arc::clone(&switch);
            let control = Arc::clone(&control);
            ResetBarrier::new(count, config.quorum).with_release_hook(move |epoch| {
                if !switch.is_forwarding() {
                    info!(%epoch, "data and config planes open");
                }
                switch.set_forwarding(true);
                control.set_open(true);
            })
        };

        Ok(Arc::new(Self {
            greeting: Greeting {
                session_count,
                reset_interval: config.reset_interval,
                timeout: config.handshake_timeout,
            },
            sessions,
            switch,
            barrier,
            time: TimeSync::new(count, config.lookahead),
            control,
            traffic,
        }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, index: SessionIndex) -> SessionState {
        self.sessions.state(index)
    }

    pub fn connected_sessions(&self) -> Vec<SessionIndex> {
        self.sessions.connected()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn switch(&self) -> &Switch {
        &self.switch
    }

    pub fn barrier(&self) -> &ResetBarrier {
        &self.barrier
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.time
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn traffic(&self) -> Option<&TrafficMonitor> {
        self.traffic.as_deref()
    }

    pub fn greeting(&self) -> Greeting {
        self.greeting
    }

    /// Handshake on a fresh conduit, then attach it as session `index`.
    pub fn adopt(
        self: &Arc<Self>,
        index: SessionIndex,
        conduit: Arc<dyn Conduit>,
    ) -> FabricResult<SessionThreads> {
        let name = session::handshake(conduit.as_ref(), index, self.greeting)?;
        self.attach(index, name, conduit)
    }

    /// Bind an already handshaken conduit to session `index`: bring its
    /// switch port up and start its reader and sync worker.
    pub fn attach(
        self: &Arc<Self>,
        index: SessionIndex,
        name: String,
        conduit: Arc<dyn Conduit>,
    ) -> FabricResult<SessionThreads> {
        info!(%index, %name, peer = %conduit.peer(), "session connected");
        self.sessions.connect(index, name, Arc::clone(&conduit))?;
        self.switch.register_port(index.port(), Arc::clone(&conduit))?;

        let (requests, inbox) = mpsc::channel();
        let worker = {
            let fabric = Arc::clone(self);
            thread::Builder::new()
                .name(format!("session-{}-sync", index.0))
                .spawn(move || worker_loop(&fabric, index, inbox))?
        };
        let reader = {
            let fabric = Arc::clone(self);
            thread::Builder::new()
                .name(format!("session-{}-reader", index.0))
                .spawn(move || reader_loop(&fabric, index, conduit.as_ref(), requests))?
        };
        Ok(SessionThreads {
            index,
            reader,
            worker,
        })
    }

    /// Tear session `index` down: tell the client, close its conduit, take
    /// its port down and release anything waiting on it. Safe to call any
    /// number of times from any thread.
    pub fn disconnect(&self, index: SessionIndex) -> FabricResult<()> {
        let Some(conduit) = self.sessions.begin_disconnect(index) else {
            return Ok(());
        };
        info!(%index, peer = %conduit.peer(), "disconnecting session");
        match encode(&ServerMessage::Shutdown) {
            Ok(body) => {
                if let Err(e) = conduit.send(&body) {
                    debug!(%index, error = %e, "client gone before shutdown notice");
                }
            }
            Err(e) => debug!(%index, error = %e, "cannot encode shutdown notice"),
        }
        conduit.close();
        self.switch.unregister_port(index.port());
        self.time.close_session(index);
        self.barrier.close_session(index);
        self.sessions.finish_disconnect(index);
        Ok(())
    }

    /// Stop forwarding frames and config.
    pub fn close_planes(&self) {
        self.switch.set_forwarding(false);
        self.control.set_open(false);
    }
}

fn reader_loop(
    fabric: &Fabric,
    index: SessionIndex,
    conduit: &dyn Conduit,
    requests: Sender<SyncRequest>,
) {
    loop {
        let body = match conduit.receive() {
            Ok(body) => body,
            Err(e) => {
                if fabric.session_state(index) == SessionState::Connected {
                    info!(%index, error = %e, "connection lost");
                }
                break;
            }
        };
        let message = match decode::<ClientMessage>(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!(%index, error = %e, "malformed message; dropping session");
                break;
            }
        };
        match message {
            ClientMessage::Frame(frame) => {
                if let Err(e) = fabric.switch.route(&frame, index.port()) {
                    warn!(%index, error = %e, "frame dropped");
                }
            }
            ClientMessage::Config { payload } => {
                if let Err(e) = fabric.control.deliver_inbound(index, payload) {
                    warn!(%index, error = %e, "config dropped");
                }
            }
            ClientMessage::ResetReady => {
                if requests.send(SyncRequest::ResetReady).is_err() {
                    break;
                }
            }
            ClientMessage::AdvanceTime { target } => {
                if requests.send(SyncRequest::Advance(target)).is_err() {
                    break;
                }
            }
            ClientMessage::Goodbye => {
                info!(%index, "client said goodbye");
                break;
            }
            ClientMessage::Hello { .. } => {
                warn!(%index, "repeated hello ignored");
            }
        }
    }
    drop(requests);
    if let Err(e) = fabric.disconnect(index) {
        warn!(%index, error = %e, "disconnect failed");
    }
}

fn worker_loop(fabric: &Fabric, index: SessionIndex, requests: Receiver<SyncRequest>) {
    while let Ok(request) = requests.recv() {
        let reply = match request {
            SyncRequest::ResetReady => match fabric.barrier.arrive(index) {
                Ok(epoch) => ServerMessage::ResetReleased {
                    epoch,
                    reset_interval: fabric.greeting.reset_interval,
                },
                Err(FabricError::SessionClosed(by)) if by == index => {
                    debug!(%index, "reset wait ended with the session");
                    continue;
                }
                Err(e) => {
                    info!(%index, error = %e, "reset aborted");
                    ServerMessage::ResetAborted {
                        reason: e.to_string(),
                    }
                }
            },
            SyncRequest::Advance(target) => match fabric.time.request_advance(index, target) {
                Ok(grant) => ServerMessage::TimeGranted { time: grant.time },
                Err(
                    e @ (FabricError::OutOfOrderTime { .. } | FabricError::AdvanceInFlight { .. }),
                ) => {
                    warn!(%index, error = %e, "advance rejected");
                    ServerMessage::AdvanceRejected {
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    debug!(%index, error = %e, "advance wait ended without grant");
                    continue;
                }
            },
        };
        if let Err(e) = fabric.sessions.send(index, &reply) {
            debug!(%index, error = %e, "reply not delivered");
        }
    }
}
