// Session conduits: the byte-stream connection between the server and one
// client.
//
// `Conduit` is the capability set everything else is built on: send a framed
// body, receive one, close. Three implementations:
// - `StreamConduit<TcpStream>` for the networked domain.
// - `StreamConduit<UnixStream>` for the local domain (unix only).
// - `MemoryConduit` pairs for in-process clients and tests.
//
// A stream conduit keeps separate read and write halves behind their own
// mutexes, so a reader thread blocked in `receive` never stalls the switch or
// the sync worker writing to the same client. `close` shuts the socket down,
// which fails the blocked `receive` and lets the reader thread exit.
//
// `SessionListener` binds one endpoint per session and accepts exactly one
// client on it. Accepting polls a non-blocking listener (50 ms cadence) so
// an accept timeout and a stop flag can both end the wait.

use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use fabric_protocol::SessionIndex;
use fabric_protocol::framing::{read_message, write_message};
use tracing::info;

use crate::config::{Domain, FabricConfig};
use crate::error::{FabricError, FabricResult};
use crate::lock;

/// Poll cadence for non-blocking accept.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// One bidirectional framed byte stream to a client.
pub trait Conduit: Send + Sync {
    /// Write one framed body.
    fn send(&self, body: &[u8]) -> io::Result<()>;

    /// Block until one framed body arrives. Fails once the conduit is
    /// closed from either side.
    fn receive(&self) -> io::Result<Vec<u8>>;

    /// Close both directions. Idempotent.
    fn close(&self);

    /// Bound `receive`; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

/// The stream operations `StreamConduit` needs beyond `Read + Write`.
pub trait ByteStream: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
    fn shutdown_stream(&self) -> io::Result<()>;
    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ByteStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

#[cfg(unix)]
impl ByteStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

/// Conduit over a socket stream with length-delimited framing.
pub struct StreamConduit<S: ByteStream> {
    reader: Mutex<BufReader<S>>,
    writer: Mutex<BufWriter<S>>,
    control: S,
    peer: String,
    closed: AtomicBool,
}

impl<S: ByteStream> StreamConduit<S> {
    pub fn new(stream: S, peer: String) -> io::Result<Self> {
        let reader = BufReader::new(stream.try_clone_stream()?);
        let writer = BufWriter::new(stream.try_clone_stream()?);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: stream,
            peer,
            closed: AtomicBool::new(false),
        })
    }
}

impl<S: ByteStream> Conduit for StreamConduit<S> {
    fn send(&self, body: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        write_message(&mut *lock(&self.writer), body)
    }

    fn receive(&self) -> io::Result<Vec<u8>> {
        read_message(&mut *lock(&self.reader))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Already-reset sockets report ENOTCONN here; the close stands.
            let _ = self.control.shutdown_stream();
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.control.set_stream_read_timeout(timeout)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

enum Packet {
    Data(Vec<u8>),
    Closed,
}

/// In-process conduit. `pair` returns two connected ends.
pub struct MemoryConduit {
    name: String,
    outbound: Sender<Packet>,
    loopback: Sender<Packet>,
    inbox: Mutex<Receiver<Packet>>,
    read_timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
    peer_closed: AtomicBool,
}

impl MemoryConduit {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair(name: &str) -> (Self, Self) {
        let (to_a, a_inbox) = mpsc::channel();
        let (to_b, b_inbox) = mpsc::channel();
        let a = Self::end(format!("{name}/a"), to_b.clone(), to_a.clone(), a_inbox);
        let b = Self::end(format!("{name}/b"), to_a, to_b, b_inbox);
        (a, b)
    }

    fn end(
        name: String,
        outbound: Sender<Packet>,
        loopback: Sender<Packet>,
        inbox: Receiver<Packet>,
    ) -> Self {
        Self {
            name,
            outbound,
            loopback,
            inbox: Mutex::new(inbox),
            read_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
        }
    }
}

impl Conduit for MemoryConduit {
    fn send(&self, body: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.outbound
            .send(Packet::Data(body.to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn receive(&self) -> io::Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let timeout = *lock(&self.read_timeout);
        let inbox = lock(&self.inbox);
        let packet = match timeout {
            Some(timeout) => inbox.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
                RecvTimeoutError::Disconnected => io::Error::from(io::ErrorKind::UnexpectedEof),
            })?,
            None => inbox
                .recv()
                .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?,
        };
        match packet {
            Packet::Data(body) => Ok(body),
            Packet::Closed => {
                self.peer_closed.store(true, Ordering::SeqCst);
                Err(io::ErrorKind::UnexpectedEof.into())
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Either receiver may already be gone; nothing left to wake then.
            let _ = self.outbound.send(Packet::Closed);
            let _ = self.loopback.send(Packet::Closed);
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *lock(&self.read_timeout) = timeout;
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Where a session listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`.
    Tcp(String),
    /// Unix-domain socket path.
    Local(PathBuf),
}

impl Endpoint {
    /// Endpoint for `index`: `base_port + index` on the configured address,
    /// or the socket file named after that port number in the local domain.
    /// A zero base port in the networked domain lets the OS choose.
    pub fn for_session(config: &FabricConfig, index: SessionIndex) -> Self {
        let port = u32::from(config.base_port) + index.0;
        match config.domain {
            Domain::Networked if config.base_port == 0 => {
                Self::Tcp(format!("{}:0", config.address))
            }
            Domain::Networked => Self::Tcp(format!("{}:{port}", config.address)),
            Domain::Local => Self::Local(config.socket_dir.join(format!("fabric-{port}.sock"))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Local(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local(UnixListener),
}

/// A bound endpoint waiting for its session's client.
pub struct SessionListener {
    index: SessionIndex,
    endpoint: Endpoint,
    inner: ListenerKind,
}

impl SessionListener {
    /// Bind `endpoint` for session `index`. A stale local socket file left by
    /// an earlier run is removed first.
    pub fn bind(index: SessionIndex, endpoint: &Endpoint) -> FabricResult<Self> {
        let bind_error = |source: io::Error| FabricError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };
        let (inner, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).map_err(bind_error)?;
                let bound = listener.local_addr().map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                (ListenerKind::Tcp(listener), Endpoint::Tcp(bound.to_string()))
            }
            #[cfg(unix)]
            Endpoint::Local(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(bind_error(e)),
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                (ListenerKind::Local(listener), Endpoint::Local(path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Local(_) => {
                return Err(FabricError::Argument(
                    "the local domain needs Unix-domain sockets".into(),
                ));
            }
        };
        info!(%index, %endpoint, "listening");
        Ok(Self {
            index,
            endpoint,
            inner,
        })
    }

    pub fn index(&self) -> SessionIndex {
        self.index
    }

    /// The bound endpoint, with the real port when the OS picked it.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for one client. Gives up with `Connect` once `deadline` passes or
    /// `cancelled` returns true.
    pub fn accept(
        &self,
        deadline: Option<Instant>,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> FabricResult<Arc<dyn Conduit>> {
        loop {
            if cancelled() {
                return Err(FabricError::connect(self.index, "accept cancelled"));
            }
            match self.try_accept() {
                Ok(Some(conduit)) => {
                    info!(index = %self.index, peer = %conduit.peer(), "client connected");
                    return Ok(conduit);
                }
                Ok(None) => {}
                Err(e) => return Err(FabricError::connect(self.index, e.to_string())),
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(FabricError::connect(
                    self.index,
                    format!("no client on {} before the accept timeout", self.endpoint),
                ));
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    fn try_accept(&self) -> io::Result<Option<Arc<dyn Conduit>>> {
        let accepted: io::Result<Arc<dyn Conduit>> = match &self.inner {
            ListenerKind::Tcp(listener) => listener.accept().and_then(|(stream, addr)| {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Arc::new(StreamConduit::new(stream, addr.to_string())?) as Arc<dyn Conduit>)
            }),
            #[cfg(unix)]
            ListenerKind::Local(listener) => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                let peer = self.endpoint.to_string();
                Ok(Arc::new(StreamConduit::new(stream, peer)?) as Arc<dyn Conduit>)
            }),
        };
        match accepted {
            Ok(conduit) => Ok(Some(conduit)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        if let Endpoint::Local(path) = &self.endpoint {
            // The file may already be gone if the directory was cleaned up.
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Client side: open a conduit to a listening session endpoint.
pub fn connect(endpoint: &Endpoint) -> io::Result<Arc<dyn Conduit>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())?;
            stream.set_nodelay(true)?;
            Ok(Arc::new(StreamConduit::new(stream, addr.clone())?))
        }
        #[cfg(unix)]
        Endpoint::Local(path) => {
            let stream = UnixStream::connect(path)?;
            Ok(Arc::new(StreamConduit::new(stream, endpoint.to_string())?))
        }
        #[cfg(not(unix))]
        Endpoint::Local(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix-domain sockets are not available on this platform",
        )),
    }
}
