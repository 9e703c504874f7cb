// Control plane and the command-processor seam.
//
// Config traffic never touches the switch. Each session has an inbound queue
// (fed by that session's reader thread) and an outbound path straight to its
// conduit. The plane is closed until the reset barrier first releases:
// inbound config that arrives earlier is dropped with a warning, as is
// config that finds its session's queue full.
//
// `CommandProcessor` is what the coordinator runs once the fabric is out of
// reset. It returns true if the operator explicitly asked to exit.
// `ScriptedProcessor` is the stock one: it reads line-oriented commands from
// a file or stdin and drives the clients through the `SimControl` config
// payload. While it waits for input or for a `wait-*` condition it keeps
// draining inbound config and watching the stop flag.
//
// Commands (one per line, `#` starts a comment):
//   step <ns>        set the simulation step and push it to every client
//   run <ns>         set the total simulation time and push it
//   stop             ask every client to stop
//   wait-time <ns>   block until the authorized time reaches <ns>
//   wait-clients     block until every client has disconnected
//   status           log sessions, time and traffic
//   exit             end the run with an explicit exit request
// End of input ends the run without one.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fabric_protocol::{LogicalTime, ResetEpoch, ServerMessage, SessionIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FabricError, FabricResult};
use crate::fabric::Fabric;
use crate::lock;
use crate::monitor::TrafficMonitor;
use crate::session::{SessionState, SessionTable};

/// Inbound config payloads held per session before newer ones are dropped.
pub const CONFIG_QUEUE_DEPTH: usize = 256;

struct ConfigQueue {
    tx: SyncSender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

pub struct ControlPlane {
    sessions: Arc<SessionTable>,
    queues: Vec<ConfigQueue>,
    open: AtomicBool,
}

impl ControlPlane {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        let queues = (0..sessions.len())
            .map(|_| {
                let (tx, rx) = mpsc::sync_channel(CONFIG_QUEUE_DEPTH);
                ConfigQueue {
                    tx,
                    rx: Mutex::new(rx),
                }
            })
            .collect();
        Self {
            sessions,
            queues,
            open: AtomicBool::new(false),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue config that arrived from `index`. Config is dropped while the
    /// plane is closed or the session's queue is full.
    pub fn deliver_inbound(&self, index: SessionIndex, payload: Vec<u8>) -> FabricResult<()> {
        if !self.is_open() {
            warn!(%index, bytes = payload.len(), "config before reset release dropped");
            return Ok(());
        }
        let queue = self
            .queues
            .get(index.as_usize())
            .ok_or(FabricError::SessionClosed(index))?;
        match queue.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(payload)) => {
                warn!(%index, bytes = payload.len(), "config queue full; payload dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(FabricError::SessionClosed(index)),
        }
    }

    /// Next queued config from `index`, without waiting.
    pub fn try_recv(&self, index: SessionIndex) -> Option<Vec<u8>> {
        let queue = self.queues.get(index.as_usize())?;
        lock(&queue.rx).try_recv().ok()
    }

    /// Next queued config from `index`, waiting up to `timeout`.
    pub fn recv_timeout(&self, index: SessionIndex, timeout: Duration) -> Option<Vec<u8>> {
        let queue = self.queues.get(index.as_usize())?;
        lock(&queue.rx).recv_timeout(timeout).ok()
    }

    /// Send config to one session.
    pub fn send(&self, index: SessionIndex, payload: Vec<u8>) -> FabricResult<()> {
        self.sessions.send(index, &ServerMessage::Config { payload })
    }

    /// Send config to every connected session. Returns how many got it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        self.sessions
            .connected()
            .into_iter()
            .filter(|&index| match self.send(index, payload.to_vec()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(%index, error = %e, "config broadcast skipped a session");
                    false
                }
            })
            .count()
    }
}

/// What a command processor can see and do during the run phase.
pub struct RunContext<'a> {
    fabric: &'a Fabric,
    stop: &'a AtomicBool,
}

impl<'a> RunContext<'a> {
    pub fn new(fabric: &'a Fabric, stop: &'a AtomicBool) -> Self {
        Self { fabric, stop }
    }

    pub fn control(&self) -> &ControlPlane {
        self.fabric.control()
    }

    pub fn session_count(&self) -> usize {
        self.fabric.session_count()
    }

    pub fn session_state(&self, index: SessionIndex) -> SessionState {
        self.fabric.session_state(index)
    }

    pub fn connected_sessions(&self) -> Vec<SessionIndex> {
        self.fabric.connected_sessions()
    }

    pub fn authorized_time(&self) -> LogicalTime {
        self.fabric.time_sync().authorized_time()
    }

    pub fn reset_epoch(&self) -> ResetEpoch {
        self.fabric.barrier().epoch()
    }

    pub fn traffic(&self) -> Option<&TrafficMonitor> {
        self.fabric.traffic()
    }

    /// True once the process was asked to stop (SIGINT/SIGTERM).
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Drives the fabric between reset release and shutdown.
pub trait CommandProcessor: Send {
    /// Run until done. `Ok(true)` means the operator explicitly asked to
    /// exit; `Ok(false)` means input ran out or the process was stopped.
    fn run(&mut self, ctx: &RunContext<'_>) -> FabricResult<bool>;
}

/// Simulation control block pushed to every client as a config payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimControl {
    /// Total simulation time, ns. Zero means unbounded.
    pub total_time: u64,
    /// Step size, ns.
    pub step: u64,
    pub stop_requested: bool,
}

impl SimControl {
    pub fn to_payload(&self) -> FabricResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FabricError::fatal(format!("encode sim control: {e}")))
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Step(u64),
    Run(u64),
    Stop,
    WaitTime(u64),
    WaitClients,
    Status,
    Exit,
}

/// Parse one command line. Blank lines and comments are `Ok(None)`.
fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.split('#').next().unwrap_or_default().trim();
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let mut number = || -> Result<u64, String> {
        let word = words
            .next()
            .ok_or_else(|| format!("`{verb}` needs a time in ns"))?;
        word.parse()
            .map_err(|_| format!("`{word}` is not a time in ns"))
    };
    let command = match verb {
        "step" => Command::Step(number()?),
        "run" => Command::Run(number()?),
        "stop" => Command::Stop,
        "wait-time" => Command::WaitTime(number()?),
        "wait-clients" => Command::WaitClients,
        "status" => Command::Status,
        "exit" | "quit" => Command::Exit,
        other => return Err(format!("unknown command `{other}`")),
    };
    if let Some(extra) = words.next() {
        return Err(format!("unexpected `{extra}` after `{verb}`"));
    }
    Ok(Some(command))
}

/// One step of reading the command source.
enum Input {
    Line(String),
    Exhausted,
    Stopped,
}

/// Reads commands from a line source.
///
/// Lines are read on a `command-input` thread and handed over a channel, so
/// a source that never produces a line (an idle terminal) cannot keep the
/// processor from noticing a stop request.
pub struct ScriptedProcessor {
    input: Option<Box<dyn BufRead + Send>>,
    lines: Option<Receiver<io::Result<String>>>,
    control: SimControl,
    poll: Duration,
}

impl ScriptedProcessor {
    pub fn new(input: impl BufRead + Send + 'static) -> Self {
        Self {
            input: Some(Box::new(input)),
            lines: None,
            control: SimControl::default(),
            poll: Duration::from_millis(20),
        }
    }

    pub fn from_file(path: &Path) -> FabricResult<Self> {
        let file = File::open(path).map_err(|e| {
            FabricError::Argument(format!("cannot open command file {}: {e}", path.display()))
        })?;
        Ok(Self::new(BufReader::new(file)))
    }

    /// Start the reader thread on first use.
    fn lines(&mut self) -> FabricResult<&Receiver<io::Result<String>>> {
        if let Some(mut input) = self.input.take() {
            let (tx, rx) = mpsc::channel();
            thread::Builder::new()
                .name("command-input".into())
                .spawn(move || read_lines(input.as_mut(), &tx))?;
            self.lines = Some(rx);
        }
        self.lines
            .as_ref()
            .ok_or_else(|| FabricError::fatal("command input already closed"))
    }

    /// Wait for the next line, draining client config on every tick.
    fn next_line(&mut self, ctx: &RunContext<'_>) -> FabricResult<Input> {
        let poll = self.poll;
        loop {
            self.drain_inbound(ctx);
            if ctx.stop_requested() {
                return Ok(Input::Stopped);
            }
            match self.lines()?.recv_timeout(poll) {
                Ok(Ok(line)) => return Ok(Input::Line(line)),
                Ok(Err(e)) => return Err(e.into()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(Input::Exhausted),
            }
        }
    }

    fn push_control(&self, ctx: &RunContext<'_>) -> FabricResult<()> {
        let reached = ctx.control().broadcast(&self.control.to_payload()?);
        info!(control = ?self.control, clients = reached, "sim control pushed");
        Ok(())
    }

    /// Log and discard config the clients sent us.
    fn drain_inbound(&self, ctx: &RunContext<'_>) {
        for i in 0..ctx.session_count() {
            let index = SessionIndex(i as u32);
            while let Some(payload) = ctx.control().try_recv(index) {
                match SimControl::from_payload(&payload) {
                    Some(control) => info!(%index, ?control, "client reported control state"),
                    None => debug!(%index, bytes = payload.len(), "config from client"),
                }
            }
        }
    }

    /// Poll until `done` or the process is stopped. Returns false if stopped.
    fn wait_until(&self, ctx: &RunContext<'_>, done: impl Fn() -> bool) -> bool {
        loop {
            self.drain_inbound(ctx);
            if done() {
                return true;
            }
            if ctx.stop_requested() {
                return false;
            }
            thread::sleep(self.poll);
        }
    }

    fn log_status(&self, ctx: &RunContext<'_>) {
        let connected = ctx.connected_sessions();
        info!(
            epoch = %ctx.reset_epoch(),
            authorized = %ctx.authorized_time(),
            connected = connected.len(),
            sessions = ctx.session_count(),
            "status"
        );
        if let Some(traffic) = ctx.traffic() {
            let totals = traffic.totals();
            info!(
                rx_frames = totals.rx_frames,
                tx_frames = totals.tx_frames,
                rx_bytes = totals.rx_bytes,
                tx_bytes = totals.tx_bytes,
                "traffic"
            );
        }
    }
}

/// Body of the `command-input` thread. Ends at end of input, on the first
/// read error, or once the processor stops listening.
fn read_lines(input: &mut dyn BufRead, lines: &Sender<io::Result<String>>) {
    loop {
        let mut line = String::new();
        let next = match input.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => Ok(line),
            Err(e) => Err(e),
        };
        let failed = next.is_err();
        if lines.send(next).is_err() || failed {
            return;
        }
    }
}

impl CommandProcessor for ScriptedProcessor {
    fn run(&mut self, ctx: &RunContext<'_>) -> FabricResult<bool> {
        let mut line_no = 0usize;
        loop {
            let line = match self.next_line(ctx)? {
                Input::Line(line) => line,
                Input::Exhausted => {
                    debug!("command input exhausted");
                    return Ok(false);
                }
                Input::Stopped => {
                    info!("stop requested; leaving command loop");
                    return Ok(false);
                }
            };
            line_no += 1;
            let command = match parse_command(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(reason) => {
                    warn!(line = line_no, %reason, "command ignored");
                    continue;
                }
            };
            debug!(line = line_no, ?command, "command");
            match command {
                Command::Step(ns) => {
                    self.control.step = ns;
                    self.push_control(ctx)?;
                }
                Command::Run(ns) => {
                    self.control.total_time = ns;
                    self.push_control(ctx)?;
                }
                Command::Stop => {
                    self.control.stop_requested = true;
                    self.push_control(ctx)?;
                }
                Command::WaitTime(ns) => {
                    let target = LogicalTime(ns);
                    let reached = self.wait_until(ctx, || {
                        ctx.authorized_time() >= target || ctx.connected_sessions().is_empty()
                    });
                    if reached {
                        info!(authorized = %ctx.authorized_time(), "wait-time done");
                    }
                }
                Command::WaitClients => {
                    if self.wait_until(ctx, || ctx.connected_sessions().is_empty()) {
                        info!("all clients disconnected");
                    }
                }
                Command::Status => self.log_status(ctx),
                Command::Exit => {
                    info!("exit command received");
                    return Ok(true);
                }
            }
        }
    }
}
