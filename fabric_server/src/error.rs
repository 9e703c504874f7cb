// Error taxonomy for the fabric server.
//
// Every fallible path in the crate returns `FabricError`. The variants follow
// the failure classes the coordinator distinguishes: setup failures
// (`Argument`, `Bind`, `Connect`) abort startup, per-session failures
// (`OutOfOrderTime`, `AdvanceInFlight`, `Routing`, `SessionClosed`) stay with
// the session that caused them, and anything else escalates as `Fatal`/`Io`
// to the coordinator's single top-level handler, which renders a
// `Diagnostic` before best-effort shutdown.

use std::fmt;
use std::io;
use std::panic::Location;

use fabric_protocol::{LogicalTime, MacAddress, PortIndex, SessionIndex};
use thiserror::Error;

/// Result type for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors raised by the fabric core.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Bad command-line or configuration input.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A session endpoint could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    /// A session failed to connect or to complete its handshake.
    #[error("{session} failed to connect: {reason}")]
    Connect {
        session: SessionIndex,
        reason: String,
    },

    /// A session asked for a time earlier than one it was already granted.
    #[error("{session} asked to advance to {requested}, behind its granted {granted}")]
    OutOfOrderTime {
        session: SessionIndex,
        requested: LogicalTime,
        granted: LogicalTime,
    },

    /// A session issued a second advance request while one was pending.
    #[error("{session} already has an advance request in flight")]
    AdvanceInFlight { session: SessionIndex },

    /// A frame could not be delivered; it has been dropped.
    #[error("cannot route frame from {ingress} to {destination}: {reason}")]
    Routing {
        ingress: PortIndex,
        destination: MacAddress,
        reason: RouteFailure,
    },

    /// The session went away while something was waiting on it.
    #[error("{0} closed")]
    SessionClosed(SessionIndex),

    /// Unclassified runtime failure.
    #[error("{message}")]
    Fatal {
        message: String,
        location: &'static Location<'static>,
    },

    /// I/O failure outside a specific session.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Why the switch could not resolve or reach a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteFailure {
    /// No station, learned address or link matches the destination.
    UnknownDestination,
    /// The destination port has no connected session.
    PortDown(PortIndex),
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDestination => f.write_str("no forwarding entry"),
            Self::PortDown(port) => write!(f, "{port} is down"),
        }
    }
}

/// Failure class, independent of the variant's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Bind,
    Connect,
    OutOfOrderTime,
    Routing,
    SessionClosed,
    FatalRuntime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Argument => "ArgumentError",
            Self::Bind => "BindError",
            Self::Connect => "ConnectError",
            Self::OutOfOrderTime => "OutOfOrderTimeError",
            Self::Routing => "RoutingError",
            Self::SessionClosed => "SessionClosed",
            Self::FatalRuntime => "FatalRuntimeError",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Isolated to one session or one frame; the fabric keeps running.
    Warning,
    /// Rejected input; nothing was started.
    Error,
    /// Aborts the run.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

impl FabricError {
    /// Build an unclassified runtime failure tagged with the caller's source
    /// location.
    #[track_caller]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn connect(session: SessionIndex, reason: impl Into<String>) -> Self {
        Self::Connect {
            session,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Argument(_) => ErrorKind::Argument,
            Self::Bind { .. } => ErrorKind::Bind,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::OutOfOrderTime { .. } | Self::AdvanceInFlight { .. } => {
                ErrorKind::OutOfOrderTime
            }
            Self::Routing { .. } => ErrorKind::Routing,
            Self::SessionClosed(_) => ErrorKind::SessionClosed,
            Self::Fatal { .. } | Self::Io(_) => ErrorKind::FatalRuntime,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::OutOfOrderTime | ErrorKind::Routing | ErrorKind::SessionClosed => {
                Severity::Warning
            }
            ErrorKind::Argument => Severity::Error,
            ErrorKind::Bind | ErrorKind::Connect | ErrorKind::FatalRuntime => Severity::Fatal,
        }
    }

    /// True for errors that stay with one session or frame.
    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Warning
    }

    /// Source location for errors that carry one.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            Self::Fatal { location, .. } => Some(*location),
            _ => None,
        }
    }
}

/// Operator-facing rendering of an error that ended a run: kind, where it
/// happened, severity, and the message.
pub struct Diagnostic<'a> {
    pub error: &'a FabricError,
    pub phase: &'static str,
}

impl<'a> Diagnostic<'a> {
    pub fn new(error: &'a FabricError, phase: &'static str) -> Self {
        Self { error, phase }
    }
}

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error.kind())?;
        writeln!(f, "Message: {}", self.error)?;
        writeln!(f, "Severity: {}", self.error.severity())?;
        match self.error.location() {
            Some(location) => writeln!(
                f,
                "Where: {} phase, line #{} in {}",
                self.phase,
                location.line(),
                location.file()
            )?,
            None => writeln!(f, "Where: {} phase", self.phase)?,
        }
        write!(f, "Fatal Error: Program aborting.")
    }
}
